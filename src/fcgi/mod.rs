/*!
FastCGI responder transport.

One thread reads records from a connection and demultiplexes them by request
id. A request thread is started once its PARAMS stream is complete; STDIN
records are fed to it through a channel. Records from concurrent requests on the
same connection are serialized through a shared writer.
*/
mod conn;
pub mod record;

pub use conn::{FcgiResponseWriter, FcgiService};
