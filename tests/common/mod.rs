//! In-process mock broker for integration tests.
//!
//! Speaks enough of the wire protocol to exercise the client end to end:
//! INFO/CONNECT handshake, PING/PONG, SUB/UNSUB with auto-unsubscribe
//! limits, PUB/HPUB routing with wildcard matching, queue-group
//! round-robin, and no-responders statuses. Request subjects can be
//! scripted with responders, which is how the persistent-stream API is
//! emulated.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A frame a responder wants delivered to the client.
pub struct OutFrame {
    /// Subject used for routing against the client's subscriptions.
    pub route: String,
    /// Subject written into the MSG frame.
    pub subject: String,
    pub reply: Option<String>,
    /// Raw headers block (`NATS/1.0...\r\n\r\n`), if any.
    pub headers: Option<String>,
    pub payload: Vec<u8>,
}

impl OutFrame {
    pub fn msg(route: &str, payload: &[u8]) -> OutFrame {
        OutFrame {
            route: route.to_string(),
            subject: route.to_string(),
            reply: None,
            headers: None,
            payload: payload.to_vec(),
        }
    }

    pub fn with_subject(mut self, subject: &str) -> OutFrame {
        self.subject = subject.to_string();
        self
    }

    pub fn with_reply(mut self, reply: &str) -> OutFrame {
        self.reply = Some(reply.to_string());
        self
    }

    pub fn status(route: &str, code: u16, description: &str) -> OutFrame {
        let headers = if description.is_empty() {
            format!("NATS/1.0 {code}\r\n\r\n")
        } else {
            format!("NATS/1.0 {code} {description}\r\n\r\n")
        };
        OutFrame {
            route: route.to_string(),
            subject: route.to_string(),
            reply: None,
            headers: Some(headers),
            payload: Vec::new(),
        }
    }
}

pub struct Request {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

type Responder = Box<dyn Fn(&Request) -> Vec<OutFrame> + Send + Sync>;

struct SubEntry {
    subject: String,
    queue: Option<String>,
    delivered: u64,
    max: Option<u64>,
}

struct ClientConn {
    writer: Mutex<TcpStream>,
    subs: Mutex<HashMap<u64, SubEntry>>,
    rr: Mutex<HashMap<String, usize>>,
    alive: AtomicBool,
}

struct Inner {
    answer_pings: AtomicBool,
    stop: AtomicBool,
    accepted: AtomicU64,
    responders: Mutex<Vec<(String, Responder)>>,
    conns: Mutex<Vec<Arc<ClientConn>>>,
}

pub struct MockServer {
    pub addr: String,
    inner: Arc<Inner>,
}

impl MockServer {
    pub fn start() -> MockServer {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock broker");
        let addr = listener.local_addr().unwrap().to_string();
        listener.set_nonblocking(true).unwrap();
        let inner = Arc::new(Inner {
            answer_pings: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            responders: Mutex::new(Vec::new()),
            conns: Mutex::new(Vec::new()),
        });
        let accept_inner = Arc::clone(&inner);
        std::thread::spawn(move || loop {
            if accept_inner.stop.load(Ordering::Acquire) {
                drop(listener);
                return;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).unwrap();
                    accept_inner.accepted.fetch_add(1, Ordering::SeqCst);
                    let conn_inner = Arc::clone(&accept_inner);
                    std::thread::spawn(move || serve_client(conn_inner, stream));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(_) => return,
            }
        });
        MockServer { addr, inner }
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    pub fn connections_accepted(&self) -> u64 {
        self.inner.accepted.load(Ordering::SeqCst)
    }

    pub fn answer_pings(&self, on: bool) {
        self.inner.answer_pings.store(on, Ordering::SeqCst);
    }

    /// Registers a scripted handler for requests whose subject starts
    /// with `prefix`.
    pub fn respond_to(
        &self,
        prefix: &str,
        f: impl Fn(&Request) -> Vec<OutFrame> + Send + Sync + 'static,
    ) {
        self.inner
            .responders
            .lock()
            .unwrap()
            .push((prefix.to_string(), Box::new(f)));
    }

    /// Severs every live client connection, keeping the listener up.
    pub fn drop_clients(&self) {
        let conns = self.inner.conns.lock().unwrap();
        for conn in conns.iter() {
            conn.alive.store(false, Ordering::SeqCst);
            let _ = conn.writer.lock().unwrap().shutdown(Shutdown::Both);
        }
    }

    /// Stops accepting new connections and frees the port.
    pub fn stop_listening(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        // Give the accept loop a moment to drop the listener.
        std::thread::sleep(Duration::from_millis(20));
    }

    /// Sends frames directly, waiting until a matching subscription
    /// exists on some client.
    pub fn send(&self, frames: Vec<OutFrame>) {
        let inner = Arc::clone(&self.inner);
        deliver_frames(&inner, frames);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.drop_clients();
    }
}

fn serve_client(inner: Arc<Inner>, stream: TcpStream) {
    let info = "INFO {\"server_id\":\"mock\",\"version\":\"0.0.0\",\"proto\":1,\"headers\":true,\"max_payload\":1048576}\r\n";
    let writer = stream.try_clone().expect("clone mock stream");
    let conn = Arc::new(ClientConn {
        writer: Mutex::new(writer),
        subs: Mutex::new(HashMap::new()),
        rr: Mutex::new(HashMap::new()),
        alive: AtomicBool::new(true),
    });
    if conn
        .writer
        .lock()
        .unwrap()
        .write_all(info.as_bytes())
        .is_err()
    {
        return;
    }
    inner.conns.lock().unwrap().push(Arc::clone(&conn));

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim_end();
        let mut parts = trimmed.split_ascii_whitespace();
        match parts.next().unwrap_or("") {
            "CONNECT" => {}
            "PING" => {
                if inner.answer_pings.load(Ordering::SeqCst) {
                    let _ = conn.writer.lock().unwrap().write_all(b"PONG\r\n");
                }
            }
            "PONG" => {}
            "SUB" => {
                let fields: Vec<&str> = parts.collect();
                let (subject, queue, sid) = match fields.len() {
                    2 => (fields[0], None, fields[1]),
                    3 => (fields[0], Some(fields[1].to_string()), fields[2]),
                    _ => continue,
                };
                if let Ok(sid) = sid.parse::<u64>() {
                    conn.subs.lock().unwrap().insert(
                        sid,
                        SubEntry {
                            subject: subject.to_string(),
                            queue,
                            delivered: 0,
                            max: None,
                        },
                    );
                }
            }
            "UNSUB" => {
                let fields: Vec<&str> = parts.collect();
                let Some(Ok(sid)) = fields.first().map(|s| s.parse::<u64>()) else {
                    continue;
                };
                let mut subs = conn.subs.lock().unwrap();
                match fields.get(1).map(|s| s.parse::<u64>()) {
                    Some(Ok(max)) => {
                        let remove = match subs.get_mut(&sid) {
                            Some(entry) => {
                                entry.max = Some(max);
                                entry.delivered >= max
                            }
                            None => false,
                        };
                        if remove {
                            subs.remove(&sid);
                        }
                    }
                    _ => {
                        subs.remove(&sid);
                    }
                }
            }
            "PUB" => {
                let fields: Vec<&str> = parts.collect();
                let (subject, reply, len) = match fields.len() {
                    2 => (fields[0], None, fields[1]),
                    3 => (fields[0], Some(fields[1].to_string()), fields[2]),
                    _ => continue,
                };
                let len: usize = len.parse().unwrap_or(0);
                let mut payload = vec![0u8; len + 2];
                if reader.read_exact(&mut payload).is_err() {
                    break;
                }
                payload.truncate(len);
                route_publish(&inner, subject, reply, None, payload);
            }
            "HPUB" => {
                let fields: Vec<&str> = parts.collect();
                let (subject, reply, hdr_len, total_len) = match fields.len() {
                    3 => (fields[0], None, fields[1], fields[2]),
                    4 => (
                        fields[0],
                        Some(fields[1].to_string()),
                        fields[2],
                        fields[3],
                    ),
                    _ => continue,
                };
                let hdr_len: usize = hdr_len.parse().unwrap_or(0);
                let total_len: usize = total_len.parse().unwrap_or(0);
                let mut buf = vec![0u8; total_len + 2];
                if reader.read_exact(&mut buf).is_err() {
                    break;
                }
                buf.truncate(total_len);
                let headers = String::from_utf8_lossy(&buf[..hdr_len]).into_owned();
                let payload = buf[hdr_len..].to_vec();
                route_publish(&inner, subject, reply, Some(headers), payload);
            }
            _ => {}
        }
    }
    conn.alive.store(false, Ordering::SeqCst);
    let mut conns = inner.conns.lock().unwrap();
    conns.retain(|c| !Arc::ptr_eq(c, &conn));
}

fn route_publish(
    inner: &Arc<Inner>,
    subject: &str,
    reply: Option<String>,
    headers: Option<String>,
    payload: Vec<u8>,
) {
    // Scripted request subjects first.
    {
        let responders = inner.responders.lock().unwrap();
        for (prefix, f) in responders.iter() {
            if subject.starts_with(prefix.as_str()) {
                let frames = f(&Request {
                    subject: subject.to_string(),
                    reply: reply.clone(),
                    payload: payload.clone(),
                });
                let inner = Arc::clone(inner);
                // Frames may target subscriptions the client has not set
                // up yet; deliver from a side thread that waits for them.
                std::thread::spawn(move || deliver_frames(&inner, frames));
                return;
            }
        }
    }

    let frame = OutFrame {
        route: subject.to_string(),
        subject: subject.to_string(),
        reply: reply.clone(),
        headers,
        payload,
    };
    let delivered = deliver_now(inner, &frame);
    if delivered == 0 {
        if let Some(reply) = reply {
            // No interest: tell the requester nobody is listening.
            deliver_now(inner, &OutFrame::status(&reply, 503, ""));
        }
    }
}

/// Delivers frames in order, waiting up to 2s for a matching
/// subscription to appear.
fn deliver_frames(inner: &Arc<Inner>, frames: Vec<OutFrame>) {
    for frame in frames {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if deliver_now(inner, &frame) > 0 || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

fn deliver_now(inner: &Arc<Inner>, frame: &OutFrame) -> usize {
    let conns: Vec<Arc<ClientConn>> = inner.conns.lock().unwrap().clone();
    let mut delivered = 0;
    for conn in conns {
        if !conn.alive.load(Ordering::SeqCst) {
            continue;
        }
        // Plain subscribers all get a copy; queue groups pick one member
        // round-robin.
        let mut targets: Vec<u64> = Vec::new();
        let mut groups: HashMap<String, Vec<u64>> = HashMap::new();
        {
            let subs = conn.subs.lock().unwrap();
            for (sid, entry) in subs.iter() {
                if !subject_matches(&entry.subject, &frame.route) {
                    continue;
                }
                match &entry.queue {
                    Some(queue) => groups.entry(queue.clone()).or_default().push(*sid),
                    None => targets.push(*sid),
                }
            }
        }
        for (queue, mut sids) in groups {
            sids.sort_unstable();
            let mut rr = conn.rr.lock().unwrap();
            let counter = rr.entry(queue).or_insert(0);
            let sid = sids[*counter % sids.len()];
            *counter += 1;
            targets.push(sid);
        }
        targets.sort_unstable();
        for sid in targets {
            if write_msg(&conn, sid, frame).is_ok() {
                delivered += 1;
            }
            let mut subs = conn.subs.lock().unwrap();
            let remove = match subs.get_mut(&sid) {
                Some(entry) => {
                    entry.delivered += 1;
                    entry.max.map(|max| entry.delivered >= max).unwrap_or(false)
                }
                None => false,
            };
            if remove {
                subs.remove(&sid);
            }
        }
    }
    delivered
}

fn write_msg(conn: &Arc<ClientConn>, sid: u64, frame: &OutFrame) -> std::io::Result<()> {
    let mut out = Vec::with_capacity(frame.payload.len() + 64);
    let reply = frame
        .reply
        .as_deref()
        .map(|r| format!(" {r}"))
        .unwrap_or_default();
    match &frame.headers {
        Some(headers) => {
            let total = headers.len() + frame.payload.len();
            out.extend_from_slice(
                format!(
                    "HMSG {} {}{} {} {}\r\n",
                    frame.subject,
                    sid,
                    reply,
                    headers.len(),
                    total
                )
                .as_bytes(),
            );
            out.extend_from_slice(headers.as_bytes());
        }
        None => {
            out.extend_from_slice(
                format!(
                    "MSG {} {}{} {}\r\n",
                    frame.subject,
                    sid,
                    reply,
                    frame.payload.len()
                )
                .as_bytes(),
            );
        }
    }
    out.extend_from_slice(&frame.payload);
    out.extend_from_slice(b"\r\n");
    conn.writer.lock().unwrap().write_all(&out)
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (None, None) => return true,
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
