use std::collections::HashMap;
use std::io::{self, BufReader, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use super::record::{
    decode_pairs, encode_pair, end_request_body, read_record, unknown_type_body, write_record,
    write_stream, BeginRequest, Record, RecordType, NULL_REQUEST_ID, REQUEST_COMPLETE,
    ROLE_RESPONDER, UNKNOWN_ROLE,
};
use crate::gateway::{
    reason_phrase, respond_error, CancelToken, GatewayRequest, Handler, Params, ResponseWriter,
};
use crate::listener::Stream;
use crate::response::ResponseHeaders;

type SharedWriter = Arc<Mutex<Stream>>;
type BodyChunk = io::Result<Vec<u8>>;
type Requests = Arc<Mutex<HashMap<u16, Pending>>>;

/// STDIN records queued per request before the connection reader blocks.
const BODY_QUEUE_RECORDS: usize = 8;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A request between BEGIN_REQUEST and END_REQUEST.
struct Pending {
    keep_conn: bool,
    params: Vec<u8>,
    body_tx: Option<SyncSender<BodyChunk>>,
    body_rx: Option<Receiver<BodyChunk>>,
    cancel: CancelToken,
    started: bool,
}

impl Pending {
    fn new(keep_conn: bool) -> Self {
        let (tx, rx) = sync_channel(BODY_QUEUE_RECORDS);
        Pending {
            keep_conn,
            params: Vec::new(),
            body_tx: Some(tx),
            body_rx: Some(rx),
            cancel: CancelToken::new(),
            started: false,
        }
    }

    /// Fail the body stream (if still open) and cancel the request.
    /// Never blocks: with a full queue the body just ends and the cancel flag decides.
    fn abort(&mut self, reason: &str) {
        self.cancel.cancel();
        if let Some(tx) = self.body_tx.take() {
            let err = io::Error::new(io::ErrorKind::ConnectionAborted, reason.to_string());
            let _ = tx.try_send(Err(err));
        }
    }
}

/// Serves FastCGI connections with a gateway handler.
#[derive(Clone)]
pub struct FcgiService {
    handler: Arc<dyn Handler>,
    max_reqs: Option<usize>,
}

impl FcgiService {
    /// `max_reqs` is advertised through FCGI_GET_VALUES when set.
    pub fn new(handler: Arc<dyn Handler>, max_reqs: Option<usize>) -> Self {
        FcgiService { handler, max_reqs }
    }

    /// Read records until the peer closes the connection or breaks the protocol.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn serve_connection(&self, stream: Stream) {
        let writer: SharedWriter = match stream.try_clone() {
            Ok(s) => Arc::new(Mutex::new(s)),
            Err(e) => {
                tracing::warn!(error = %e, "cannot clone connection; dropping it");
                return;
            }
        };
        let requests: Requests = Arc::new(Mutex::new(HashMap::new()));
        let mut reader = BufReader::new(stream);

        let result = loop {
            match read_record(&mut reader) {
                Ok(Some(rec)) => {
                    if let Err(e) = self.on_record(rec, &writer, &requests) {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        match result {
            Ok(()) => tracing::debug!("FastCGI connection closed"),
            Err(e) => tracing::warn!(error = %e, "FastCGI connection error"),
        }

        // Requests still waiting for input can never complete now.
        let mut reqs = lock(&requests);
        reqs.retain(|id, p| {
            if !p.started {
                return false;
            }
            if p.body_tx.is_some() {
                tracing::debug!(request_id = id, "aborting request on connection loss");
                p.abort("connection closed");
            }
            true
        });
    }

    fn on_record(&self, rec: Record, writer: &SharedWriter, requests: &Requests) -> io::Result<()> {
        let id = rec.request_id;
        match rec.kind {
            RecordType::BeginRequest => {
                let begin = BeginRequest::parse(&rec.content)?;
                if begin.role != ROLE_RESPONDER {
                    tracing::warn!(request_id = id, role = begin.role, "unsupported FastCGI role");
                    let body = end_request_body(0, UNKNOWN_ROLE);
                    return write_record(&mut *lock(writer), RecordType::EndRequest, id, &body);
                }
                let mut reqs = lock(requests);
                if reqs.contains_key(&id) {
                    tracing::warn!(request_id = id, "duplicate BEGIN_REQUEST ignored");
                } else {
                    reqs.insert(id, Pending::new(begin.keep_conn));
                }
            }
            RecordType::Params => {
                let start = {
                    let mut reqs = lock(requests);
                    match reqs.get_mut(&id) {
                        Some(p) if !p.started => {
                            if rec.content.is_empty() {
                                p.started = true;
                                Some((
                                    p.keep_conn,
                                    std::mem::take(&mut p.params),
                                    p.body_rx.take(),
                                    p.cancel.clone(),
                                ))
                            } else {
                                p.params.extend_from_slice(&rec.content);
                                None
                            }
                        }
                        _ => None,
                    }
                };
                if let Some((keep_conn, raw, Some(body_rx), cancel)) = start {
                    self.start_request(id, keep_conn, raw, body_rx, cancel, writer, requests);
                }
            }
            RecordType::Stdin => {
                let tx = match lock(requests).get_mut(&id) {
                    Some(p) if rec.content.is_empty() => p.body_tx.take(),
                    Some(p) => p.body_tx.clone(),
                    None => None,
                };
                // Blocks while the script is behind on its input; the map stays unlocked.
                if let Some(tx) = tx {
                    if !rec.content.is_empty() && tx.send(Ok(rec.content)).is_err() {
                        // receiver gone: the request stopped reading its body
                        if let Some(p) = lock(requests).get_mut(&id) {
                            p.body_tx = None;
                        }
                    }
                }
            }
            RecordType::AbortRequest => {
                let mut reqs = lock(requests);
                if let Some(p) = reqs.get_mut(&id) {
                    tracing::info!(request_id = id, "request aborted by web server");
                    p.abort("request aborted by web server");
                    if !p.started {
                        reqs.remove(&id);
                        drop(reqs);
                        let body = end_request_body(0, REQUEST_COMPLETE);
                        write_record(&mut *lock(writer), RecordType::EndRequest, id, &body)?;
                    }
                }
            }
            RecordType::GetValues if id == NULL_REQUEST_ID => {
                let reply = self.get_values_reply(&rec.content)?;
                write_record(&mut *lock(writer), RecordType::GetValuesResult, NULL_REQUEST_ID, &reply)?;
            }
            RecordType::Other(kind) if id == NULL_REQUEST_ID => {
                write_record(
                    &mut *lock(writer),
                    RecordType::UnknownType,
                    NULL_REQUEST_ID,
                    &unknown_type_body(kind),
                )?;
            }
            other => tracing::debug!(request_id = id, kind = ?other, "ignoring record"),
        }
        Ok(())
    }

    fn get_values_reply(&self, content: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        for (name, _) in decode_pairs(content)? {
            let value = match name.as_slice() {
                b"FCGI_MPXS_CONNS" => Some("1".to_string()),
                b"FCGI_MAX_REQS" | b"FCGI_MAX_CONNS" => self.max_reqs.map(|n| n.to_string()),
                _ => None,
            };
            if let Some(v) = value {
                encode_pair(&mut out, &name, v.as_bytes());
            }
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn start_request(
        &self,
        id: u16,
        keep_conn: bool,
        raw_params: Vec<u8>,
        body_rx: Receiver<BodyChunk>,
        cancel: CancelToken,
        writer: &SharedWriter,
        requests: &Requests,
    ) {
        let handler = self.handler.clone();
        let writer = writer.clone();
        let requests = requests.clone();
        thread::spawn(move || {
            let mut w = FcgiResponseWriter::new(writer.clone(), id);
            let app_status = match decode_pairs(&raw_params) {
                Ok(pairs) => {
                    let params: Params = pairs
                        .into_iter()
                        .map(|(k, v)| {
                            (
                                String::from_utf8_lossy(&k).into_owned(),
                                String::from_utf8_lossy(&v).into_owned(),
                            )
                        })
                        .collect();
                    let req = GatewayRequest::new(params)
                        .with_body(ChannelBody::new(body_rx))
                        .with_cancel(cancel);
                    handler.serve(req, &mut w).app_status()
                }
                Err(e) => {
                    tracing::warn!(request_id = id, error = %e, "malformed FastCGI params");
                    let _ = respond_error(&mut w, 400, "malformed request parameters");
                    0
                }
            };
            // the id becomes reusable once END_REQUEST is out
            lock(&requests).remove(&id);
            if let Err(e) = w.finish(app_status) {
                tracing::debug!(request_id = id, error = %e, "failed to end request");
            }
            if !keep_conn {
                let _ = lock(&writer).shutdown(Shutdown::Both);
            }
        });
    }
}

/// Request body fed from STDIN records.
struct ChannelBody {
    rx: Receiver<BodyChunk>,
    buf: Vec<u8>,
    pos: usize,
}

impl ChannelBody {
    fn new(rx: Receiver<BodyChunk>) -> Self {
        ChannelBody {
            rx,
            buf: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelBody {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(e),
                // sender dropped: end of stream
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// `ResponseWriter` emitting FCGI_STDOUT/FCGI_STDERR records for one request.
pub struct FcgiResponseWriter {
    out: SharedWriter,
    id: u16,
    stderr_used: Arc<AtomicBool>,
    head_sent: bool,
}

impl FcgiResponseWriter {
    pub fn new(out: Arc<Mutex<Stream>>, id: u16) -> Self {
        FcgiResponseWriter {
            out,
            id,
            stderr_used: Arc::new(AtomicBool::new(false)),
            head_sent: false,
        }
    }

    /// Close the output streams and send END_REQUEST.
    pub fn finish(&mut self, app_status: u32) -> io::Result<()> {
        let mut out = lock(&self.out);
        write_record(&mut *out, RecordType::Stdout, self.id, &[])?;
        if self.stderr_used.load(Ordering::SeqCst) {
            write_record(&mut *out, RecordType::Stderr, self.id, &[])?;
        }
        let body = end_request_body(app_status, REQUEST_COMPLETE);
        write_record(&mut *out, RecordType::EndRequest, self.id, &body)?;
        out.flush()
    }
}

/// CGI-style header block: a Status line unless the script set one, then the headers.
fn encode_head(status: u16, headers: &ResponseHeaders) -> Vec<u8> {
    let mut head = String::new();
    if !headers.contains("Status") {
        head.push_str(&format!("Status: {} {}\r\n", status, reason_phrase(status)));
    }
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

impl ResponseWriter for FcgiResponseWriter {
    fn write_head(&mut self, status: u16, headers: &ResponseHeaders) -> io::Result<()> {
        if self.head_sent {
            return Err(io::Error::new(io::ErrorKind::Other, "response head already sent"));
        }
        self.head_sent = true;
        let head = encode_head(status, headers);
        write_stream(&mut *lock(&self.out), RecordType::Stdout, self.id, &head)
    }

    fn write_body(&mut self, buf: &[u8]) -> io::Result<()> {
        write_stream(&mut *lock(&self.out), RecordType::Stdout, self.id, buf)
    }

    fn stderr_sink(&self) -> Box<dyn Write + Send> {
        Box::new(StderrSink {
            out: self.out.clone(),
            id: self.id,
            used: self.stderr_used.clone(),
        })
    }
}

struct StderrSink {
    out: SharedWriter,
    id: u16,
    used: Arc<AtomicBool>,
}

impl Write for StderrSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.used.store(true, Ordering::SeqCst);
        write_stream(&mut *lock(&self.out), RecordType::Stderr, self.id, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        lock(&self.out).flush()
    }
}
