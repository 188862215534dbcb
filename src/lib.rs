/*!
fcgiwrap: a FastCGI responder that runs CGI scripts.

Each FastCGI request names a script through its CGI parameters. The script is
validated, started with a filtered environment, fed the request body, and its
CGI output (header preamble plus body) is relayed back as the response.

Modules:
- gateway: transport-agnostic request/response seam
- admission: worker limit and per-request dispatch
- lifecycle: idle timeout and orderly shutdown
- script, env, runner, response, responder: the CGI pipeline
- fcgi, listener, server: FastCGI transport and sockets
*/

pub mod admission;
pub mod config;
pub mod env;
pub mod errors;
pub mod fcgi;
pub mod gateway;
pub mod lifecycle;
pub mod listener;
pub mod logging;
pub mod responder;
pub mod response;
pub mod runner;
pub mod script;
pub mod server;
pub mod signals;

pub use admission::{dispatch, ActiveJobs, AdmissionState, Cancelled, Dispatcher, TokenPool};
pub use config::{parse_duration, parse_idle_timeout, Config};
pub use env::{is_inheritable, EnvironmentSet, InheritedEnv, DENIED_INHERIT_NAMES};
pub use errors::{ConfigError, PreambleError, RunError, ScriptError};
pub use gateway::{
    respond_error, CancelToken, Completion, GatewayRequest, Handler, Params, ResponseWriter,
};
pub use lifecycle::{IdleTimer, Lifecycle, LifecycleEvent, LifecycleState, ShutdownReason};
pub use listener::{Listener, SocketSpec, Stream};
pub use logging::LogFormat;
pub use responder::CgiResponder;
pub use response::{read_preamble, ResponseHeaders};
pub use runner::{run_script, StderrMode};
pub use script::{normalize_lexically, resolve_script, validate_script, ScriptDescriptor, ScriptPolicy, WorkDir};
pub use server::{Server, ShutdownHandle};
