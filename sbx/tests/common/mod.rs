//! In-process fake of the sandbox process and filesystem services.
//!
//! Speaks just enough HTTP/1.1 for one request per connection: unary
//! responses carry a `Content-Length`, streams are chunked envelopes.
//! `Start` spawns real local processes.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sbx_proto::envelope::encode;
use sbx_proto::filesystem::{
    EventType, FilesystemEvent, WatchDirRequest, WatchDirResponse, WatchStartEvent,
};
use sbx_proto::process::{
    CloseStdinRequest, ConnectRequest, DataEvent, EndEvent, KeepAlive, ListResponse,
    ProcessEvent, ProcessEventResponse, ProcessInfo, ProcessInput, ProcessSelector,
    SendInputRequest, SendSignalRequest, Signal, StartEvent, StartRequest,
};
use sbx_proto::{Compressor, Flags, Gzip};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

/// Command that streams a start event and some output, then ends the body
/// without an end-of-stream message.
pub const CRASH_CMD: &str = "fake-crash";

/// Command that streams a start event and then nothing, holding the
/// connection open until the client closes it.
pub const SILENT_CMD: &str = "fake-silent";

/// Watched directory whose stream goes silent after the start event.
pub const SILENT_DIR: &str = "/silent";

/// A request as seen by the fake.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub path: String,
    pub headers: HashMap<String, String>,
}

/// A running fake service.
pub struct FakeServer {
    addr: SocketAddr,
    state: Arc<State>,
}

#[derive(Default)]
struct State {
    procs: Mutex<HashMap<u32, Arc<Proc>>>,
    requests: Mutex<Vec<Recorded>>,
    /// Paths of held streams whose client closed the connection.
    closed: Mutex<Vec<String>>,
}

impl FakeServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());
        let shared = Arc::clone(&state);
        thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(conn) = conn else { continue };
                let state = Arc::clone(&shared);
                thread::spawn(move || {
                    let _ = serve(conn, &state);
                });
            }
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn client(&self) -> sbx::Client {
        sbx::Client::builder(self.url()).build().unwrap()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Last recorded request to `path`.
    pub fn last_request(&self, path: &str) -> Option<Recorded> {
        self.requests().into_iter().rev().find(|r| r.path == path)
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.state.procs.lock().unwrap().contains_key(&pid)
    }

    /// Number of recorded requests to `path`.
    pub fn request_count(&self, path: &str) -> usize {
        self.requests().iter().filter(|r| r.path == path).count()
    }

    /// Waits up to `timeout` for the client to close a held stream on `path`.
    pub fn wait_closed(&self, path: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.state.closed.lock().unwrap().iter().any(|p| p == path) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

struct Request {
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Request {
    fn unary<T: DeserializeOwned>(&self) -> T {
        let body = if self.headers.get("content-encoding").map(String::as_str) == Some("gzip") {
            Gzip::default().decompress(&self.body, 1 << 24).unwrap()
        } else {
            self.body.clone()
        };
        serde_json::from_slice(&body).unwrap()
    }

    fn stream<T: DeserializeOwned>(&self) -> T {
        let flags = self.body[0];
        let payload = &self.body[5..];
        let payload = if flags & Flags::COMPRESSED.bits() != 0 {
            Gzip::default().decompress(payload, 1 << 24).unwrap()
        } else {
            payload.to_vec()
        };
        serde_json::from_slice(&payload).unwrap()
    }
}

fn serve(conn: TcpStream, state: &Arc<State>) -> io::Result<()> {
    let mut reader = BufReader::new(conn.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let path = line.split_whitespace().nth(1).unwrap_or("/").to_owned();
    let mut headers = HashMap::new();
    loop {
        line.clear();
        reader.read_line(&mut line)?;
        let l = line.trim_end();
        if l.is_empty() {
            break;
        }
        if let Some((k, v)) = l.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_owned());
        }
    }
    let len = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0; len];
    reader.read_exact(&mut body)?;
    state.requests.lock().unwrap().push(Recorded {
        path: path.clone(),
        headers: headers.clone(),
    });

    let req = Request { headers, body };
    let mut out = conn;
    match path.as_str() {
        "/process.Process/Start" => start(&mut out, state, &req, &path),
        "/process.Process/Connect" => connect(&mut out, state, &req),
        "/process.Process/SendInput" => send_input(&mut out, state, &req),
        "/process.Process/SendSignal" => send_signal(&mut out, state, &req),
        "/process.Process/CloseStdin" => close_stdin(&mut out, state, &req),
        "/process.Process/List" => {
            let processes = state
                .procs
                .lock()
                .unwrap()
                .values()
                .map(|p| p.info.clone())
                .collect();
            respond_json(&mut out, &ListResponse { processes })
        }
        "/process.Process/Update" => respond_json(&mut out, &json!({})),
        "/filesystem.Filesystem/WatchDir" => watch_dir(&mut out, state, &req, &path),
        "/test.Slow/Sleep" => {
            thread::sleep(Duration::from_secs(2));
            respond_json(&mut out, &json!({}))
        }
        "/test.Status/Unavailable" => respond(&mut out, 503, "text/plain", b""),
        "/test.Status/Encoded" => {
            write!(
                out,
                "HTTP/1.1 503 Service Unavailable\r\nContent-Type: application/json\r\nContent-Encoding: br\r\nContent-Length: 2\r\nConnection: close\r\n\r\nxx"
            )?;
            out.flush()
        }
        "/test.Flaky/DropFirst" => {
            let seen = state
                .requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.path == path)
                .count();
            if seen == 1 {
                // Close without a response.
                return out.shutdown(Shutdown::Both);
            }
            respond_json(&mut out, &json!({}))
        }
        "/test.Flaky/Truncated" => {
            write!(
                out,
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\nConnection: close\r\n\r\n{{\"a\":"
            )?;
            out.flush()?;
            out.shutdown(Shutdown::Both)
        }
        "/test.Stream/Html" => respond(&mut out, 200, "text/html", b"<html></html>"),
        _ => respond(&mut out, 404, "text/plain", b"404 page not found"),
    }
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

struct Proc {
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    subscribers: Mutex<Subscribers>,
    info: ProcessInfo,
}

#[derive(Default)]
struct Subscribers {
    senders: Vec<Sender<ProcessEvent>>,
    ended: bool,
}

impl Proc {
    fn broadcast(&self, ev: &ProcessEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.senders.retain(|tx| tx.send(ev.clone()).is_ok());
    }

    fn end(&self, end: EndEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        let ev = ProcessEvent::End(end);
        for tx in subs.senders.drain(..) {
            let _ = tx.send(ev.clone());
        }
        subs.ended = true;
    }

    fn subscribe(&self) -> Option<Receiver<ProcessEvent>> {
        let mut subs = self.subscribers.lock().unwrap();
        if subs.ended {
            return None;
        }
        let (tx, rx) = mpsc::channel();
        subs.senders.push(tx);
        Some(rx)
    }
}

fn find(state: &State, selector: &ProcessSelector) -> Option<Arc<Proc>> {
    let procs = state.procs.lock().unwrap();
    match selector {
        ProcessSelector::Pid(pid) => procs.get(pid).cloned(),
        ProcessSelector::Tag(tag) => procs
            .values()
            .find(|p| p.info.tag.as_deref() == Some(tag.as_str()))
            .cloned(),
    }
}

fn spawn_process(
    state: &Arc<State>,
    req: StartRequest,
) -> Result<(Arc<Proc>, Receiver<ProcessEvent>), String> {
    let config = req.process;
    let mut args = config.args.clone();
    // Host shell profiles are not the sandbox's; run login shells plain.
    if config.cmd.ends_with("bash") && args.first().map(String::as_str) == Some("-l") {
        args.remove(0);
    }
    let mut cmd = Command::new(&config.cmd);
    cmd.args(&args)
        .envs(&config.envs)
        .stdin(if req.stdin == Some(true) {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }
    let mut child = cmd.spawn().map_err(|e| e.to_string())?;
    let pid = child.id();
    let stdout = child.stdout.take().unwrap();
    let stderr = child.stderr.take().unwrap();
    let stdin = child.stdin.take();

    let (tx, rx) = mpsc::channel();
    let proc = Arc::new(Proc {
        pid,
        child: Mutex::new(child),
        stdin: Mutex::new(stdin),
        subscribers: Mutex::new(Subscribers {
            senders: vec![tx],
            ended: false,
        }),
        info: ProcessInfo {
            config,
            pid,
            tag: req.tag,
        },
    });
    state.procs.lock().unwrap().insert(pid, Arc::clone(&proc));

    let out = pump_output(Arc::clone(&proc), stdout, DataEvent::Stdout);
    let err = pump_output(Arc::clone(&proc), stderr, DataEvent::Stderr);
    let state = Arc::clone(state);
    let waiter = Arc::clone(&proc);
    thread::spawn(move || {
        let _ = out.join();
        let _ = err.join();
        let status = loop {
            if let Some(status) = waiter.child.lock().unwrap().try_wait().unwrap() {
                break status;
            }
            thread::sleep(Duration::from_millis(5));
        };
        let end = match status.code() {
            Some(code) => EndEvent {
                exit_code: code,
                exited: true,
                status: format!("exit status {code}"),
                error: None,
            },
            None => EndEvent {
                exit_code: -1,
                exited: false,
                status: "signal: killed".into(),
                error: None,
            },
        };
        state.procs.lock().unwrap().remove(&pid);
        waiter.end(end);
    });
    Ok((proc, rx))
}

fn pump_output<R: Read + Send + 'static>(
    proc: Arc<Proc>,
    mut reader: R,
    wrap: fn(Vec<u8>) -> DataEvent,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => proc.broadcast(&ProcessEvent::Data(wrap(buf[..n].to_vec()))),
            }
        }
    })
}

fn start(out: &mut TcpStream, state: &Arc<State>, req: &Request, path: &str) -> io::Result<()> {
    let start: StartRequest = req.stream();
    begin_stream(out)?;
    if start.process.cmd == SILENT_CMD {
        send_msg(out, &event(ProcessEvent::Start(StartEvent { pid: 2 })))?;
        return hold_until_closed(out, state, path);
    }
    if start.process.cmd == CRASH_CMD {
        send_msg(out, &event(ProcessEvent::Start(StartEvent { pid: 1 })))?;
        send_msg(
            out,
            &event(ProcessEvent::Data(DataEvent::Stdout(b"partial".to_vec()))),
        )?;
        return finish_chunks(out);
    }
    match spawn_process(state, start) {
        Ok((proc, rx)) => {
            send_msg(out, &event(ProcessEvent::Start(StartEvent { pid: proc.pid })))?;
            forward(out, &rx)
        }
        Err(e) => end_stream(out, Some(("invalid_argument", &e))),
    }
}

fn connect(out: &mut TcpStream, state: &Arc<State>, req: &Request) -> io::Result<()> {
    let connect: ConnectRequest = req.stream();
    begin_stream(out)?;
    let subscription = find(state, &connect.process).and_then(|p| Some((p.pid, p.subscribe()?)));
    let Some((pid, rx)) = subscription else {
        return end_stream(out, Some(("not_found", "process not found")));
    };
    send_msg(out, &event(ProcessEvent::Start(StartEvent { pid })))?;
    forward(out, &rx)
}

fn forward(out: &mut TcpStream, rx: &Receiver<ProcessEvent>) -> io::Result<()> {
    for ev in rx {
        let end = matches!(ev, ProcessEvent::End(_));
        send_msg(out, &event(ev))?;
        if end {
            break;
        }
    }
    end_stream(out, None)
}

fn send_input(out: &mut TcpStream, state: &Arc<State>, req: &Request) -> io::Result<()> {
    let input: SendInputRequest = req.unary();
    let Some(proc) = find(state, &input.process) else {
        return respond_error(out, 404, "not_found", "process not found");
    };
    let mut stdin = proc.stdin.lock().unwrap();
    let Some(pipe) = stdin.as_mut() else {
        return respond_error(out, 400, "failed_precondition", "stdin is not open");
    };
    let data = match input.input {
        ProcessInput::Stdin(d) | ProcessInput::Pty(d) => d,
    };
    pipe.write_all(&data)?;
    pipe.flush()?;
    drop(stdin);
    respond_json(out, &json!({}))
}

fn send_signal(out: &mut TcpStream, state: &Arc<State>, req: &Request) -> io::Result<()> {
    let signal: SendSignalRequest = req.unary();
    let Some(proc) = find(state, &signal.process) else {
        return respond_error(out, 404, "not_found", "process not found");
    };
    match signal.signal {
        Signal::Sigkill => {
            let _ = proc.child.lock().unwrap().kill();
        }
        Signal::Sigterm => {
            let pid = proc.pid.to_string();
            let _ = Command::new("kill").args(["-TERM", pid.as_str()]).status();
        }
        _ => return respond_error(out, 400, "invalid_argument", "unsupported signal"),
    }
    respond_json(out, &json!({}))
}

fn close_stdin(out: &mut TcpStream, state: &Arc<State>, req: &Request) -> io::Result<()> {
    let close: CloseStdinRequest = req.unary();
    let Some(proc) = find(state, &close.process) else {
        return respond_error(out, 404, "not_found", "process not found");
    };
    proc.stdin.lock().unwrap().take();
    respond_json(out, &json!({}))
}

fn event(event: ProcessEvent) -> ProcessEventResponse {
    ProcessEventResponse { event }
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

fn watch_dir(out: &mut TcpStream, state: &Arc<State>, req: &Request, path: &str) -> io::Result<()> {
    let watch: WatchDirRequest = req.stream();
    begin_stream(out)?;
    send_msg(out, &WatchDirResponse::Start(WatchStartEvent {}))?;
    if watch.path == SILENT_DIR {
        return hold_until_closed(out, state, path);
    }
    let script = [
        (EventType::Create, "a.txt"),
        (EventType::Write, "a.txt"),
        (EventType::Unspecified, "ignored"),
        (EventType::Remove, "a.txt"),
    ];
    for (kind, name) in script {
        send_msg(
            out,
            &WatchDirResponse::Filesystem(FilesystemEvent {
                name: format!("{}/{name}", watch.path),
                kind,
            }),
        )?;
    }
    send_msg(out, &WatchDirResponse::Keepalive(KeepAlive {}))?;
    end_stream(out, Some(("not_found", "watched directory was removed")))
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn respond(out: &mut TcpStream, status: u16, content_type: &str, body: &[u8]) -> io::Result<()> {
    write!(
        out,
        "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        reason(status),
        body.len()
    )?;
    out.write_all(body)?;
    out.flush()
}

fn respond_json<T: Serialize>(out: &mut TcpStream, msg: &T) -> io::Result<()> {
    respond(out, 200, "application/json", &serde_json::to_vec(msg).unwrap())
}

fn respond_error(out: &mut TcpStream, status: u16, code: &str, message: &str) -> io::Result<()> {
    let body = json!({ "code": code, "message": message }).to_string();
    respond(out, status, "application/json", body.as_bytes())
}

fn begin_stream(out: &mut TcpStream) -> io::Result<()> {
    write!(
        out,
        "HTTP/1.1 200 OK\r\nContent-Type: application/connect+json\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
    )?;
    out.flush()
}

fn send_envelope(out: &mut TcpStream, flags: Flags, payload: &[u8]) -> io::Result<()> {
    let envelope = encode(flags, payload).unwrap();
    write!(out, "{:x}\r\n", envelope.len())?;
    out.write_all(&envelope)?;
    out.write_all(b"\r\n")?;
    out.flush()
}

fn send_msg<T: Serialize>(out: &mut TcpStream, msg: &T) -> io::Result<()> {
    send_envelope(out, Flags::NONE, &serde_json::to_vec(msg).unwrap())
}

fn end_stream(out: &mut TcpStream, error: Option<(&str, &str)>) -> io::Result<()> {
    let trailer = match error {
        Some((code, message)) => json!({ "error": { "code": code, "message": message } }),
        None => json!({}),
    };
    send_envelope(out, Flags::END_STREAM, trailer.to_string().as_bytes())?;
    finish_chunks(out)
}

/// Sends nothing more and records `path` once the client closes the
/// connection.
fn hold_until_closed(out: &mut TcpStream, state: &State, path: &str) -> io::Result<()> {
    let mut buf = [0u8; 64];
    loop {
        match out.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    state.closed.lock().unwrap().push(path.to_owned());
    Ok(())
}

fn finish_chunks(out: &mut TcpStream) -> io::Result<()> {
    out.write_all(b"0\r\n\r\n")?;
    out.flush()
}
