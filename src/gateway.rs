/*!
Seam between the transport and the CGI core.

The transport hands each request over as a `GatewayRequest` (parameters, a body
stream and a cancellation token) together with a `ResponseWriter`. Everything
behind `Handler` is transport-agnostic.
*/
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::response::ResponseHeaders;

/// CGI meta-variables of one request.
pub type Params = HashMap<String, String>;

/// Cloneable cancellation flag shared between a transport and a handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// One request as delivered by the transport.
pub struct GatewayRequest {
    pub params: Params,
    pub body: Box<dyn Read + Send>,
    pub cancel: CancelToken,
}

impl GatewayRequest {
    /// Request with an empty body and a fresh token.
    pub fn new(params: Params) -> Self {
        GatewayRequest {
            params,
            body: Box::new(io::empty()),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_body<R: Read + Send + 'static>(mut self, body: R) -> Self {
        self.body = Box::new(body);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Response side of the transport: a header block, then body bytes.
pub trait ResponseWriter: Send {
    /// Send the status and header block. Must be called once, before any body.
    fn write_head(&mut self, status: u16, headers: &ResponseHeaders) -> io::Result<()>;

    /// Append body bytes.
    fn write_body(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Diagnostic stream that travels with the response (FastCGI stderr).
    fn stderr_sink(&self) -> Box<dyn Write + Send>;
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The script ran and was reaped; carries the application status.
    Exited(i32),
    /// Answered with an error response before or instead of running the script.
    Rejected,
    /// Cancelled or failed mid-stream.
    Aborted,
}

impl Completion {
    /// Status reported back to the transport.
    pub fn app_status(&self) -> u32 {
        match self {
            Completion::Exited(code) => u32::try_from(*code).unwrap_or(0),
            Completion::Rejected | Completion::Aborted => 0,
        }
    }
}

/// Something that serves gateway requests.
pub trait Handler: Send + Sync {
    fn serve(&self, req: GatewayRequest, w: &mut dyn ResponseWriter) -> Completion;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn serve(&self, req: GatewayRequest, w: &mut dyn ResponseWriter) -> Completion {
        (**self).serve(req, w)
    }
}

/// Canonical reason phrase for the few statuses the bridge produces itself.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Plain-text error response.
pub fn respond_error(w: &mut dyn ResponseWriter, status: u16, message: &str) -> io::Result<()> {
    let mut headers = ResponseHeaders::new();
    headers.add("Content-Type", "text/plain; charset=utf-8");
    headers.add("X-Content-Type-Options", "nosniff");
    w.write_head(status, &headers)?;
    w.write_body(message.as_bytes())?;
    w.write_body(b"\n")
}
