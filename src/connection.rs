//! Connection to the messaging fabric.
//!
//! A connection owns the socket, the parser, the outbound buffer, the
//! subscription routing table, and the reconnect engine. Two threads are
//! attached to a live socket: the reader (blocking reads feeding the
//! parser) and the flusher (draining the outbound buffer on signal).
//! Both carry the generation number of the socket they serve; a stale
//! generation means a reconnect or close already ran and the thread just
//! exits.
//!
//! Publishes issued while reconnecting are buffered up to
//! `Options::reconnect_buf_size` and replayed once the new socket is up.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::dispatch::{self, ItemKind};
use crate::error::{Error, Result};
use crate::headers::{HeaderMap, STATUS_NO_RESPONDERS};
use crate::inbox::{self, INBOX_PREFIX};
use crate::message::Message;
use crate::options::{Options, SubscribeOptions};
use crate::parser::{Parser, ServerOp};
use crate::servers::{Scheme, ServerPool};
use crate::subject;
use crate::subscription::{DeliverMode, MessageCallback, SubState, Subscription};
use crate::timer::Timer;
use crate::wire::{self, ConnectRequest, ServerInfo};

const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const READ_BUF_SIZE: usize = 32 * 1024;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    DrainingSubs,
    DrainingPubs,
    Closed,
}

enum PongOutcome {
    Pending,
    Done,
    Disconnected,
    Closed,
}

struct PongWaiter {
    mu: Mutex<PongOutcome>,
    cv: Condvar,
}

impl PongWaiter {
    fn new() -> Arc<Self> {
        Arc::new(PongWaiter {
            mu: Mutex::new(PongOutcome::Pending),
            cv: Condvar::new(),
        })
    }

    fn complete(&self, outcome: PongOutcome) {
        let mut st = self.mu.lock().unwrap();
        if matches!(*st, PongOutcome::Pending) {
            *st = outcome;
            self.cv.notify_all();
        }
    }

    fn wait(&self, deadline: Instant) -> Result<()> {
        let mut st = self.mu.lock().unwrap();
        loop {
            match *st {
                PongOutcome::Done => return Ok(()),
                PongOutcome::Disconnected => return Err(Error::ConnectionDisconnected),
                PongOutcome::Closed => return Err(Error::ConnectionClosed),
                PongOutcome::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (guard, _) = self.cv.wait_timeout(st, deadline - now).unwrap();
            st = guard;
        }
    }
}

pub(crate) struct ConnState {
    pub status: ConnStatus,
    /// Socket generation; bumped on every (re)connect and on close.
    pub gen: u64,
    pub stream: Option<Arc<TcpStream>>,
    pub out_buf: Vec<u8>,
    /// Publish buffer while reconnecting.
    pub pending: Option<Vec<u8>>,
    pub server_info: ServerInfo,
    pub pool: ServerPool,
    pub pings_out: u32,
    pub pong_waiters: VecDeque<Arc<PongWaiter>>,
    pub ping_timer: Option<Timer>,
    pub last_error: Option<String>,
}

pub(crate) struct ConnCore {
    pub opts: Options,
    pub state: Mutex<ConnState>,
    pub flush_cv: Condvar,
    pub status_cv: Condvar,
    pub subs: Mutex<HashMap<u64, Arc<SubState>>>,
    pub next_sid: AtomicU64,
}

/// Handle to a connection. Clones share the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) core: Arc<ConnCore>,
}

/// Opens a connection to `url` with default options.
pub fn connect(url: &str) -> Result<Connection> {
    Options::new().server(url).connect()
}

impl Connection {
    pub(crate) fn from_core(core: Arc<ConnCore>) -> Connection {
        Connection { core }
    }

    pub(crate) fn connect_with_options(opts: Options) -> Result<Connection> {
        let servers: Vec<String> = if opts.servers.is_empty() {
            vec![format!("nats://127.0.0.1:{}", crate::servers::DEFAULT_PORT)]
        } else {
            opts.servers.clone()
        };
        let pool = ServerPool::from_urls(&servers, !opts.no_randomize)?;

        let core = Arc::new(ConnCore {
            opts,
            state: Mutex::new(ConnState {
                status: ConnStatus::Connecting,
                gen: 0,
                stream: None,
                out_buf: Vec::with_capacity(READ_BUF_SIZE),
                pending: None,
                server_info: ServerInfo::default(),
                pool,
                pings_out: 0,
                pong_waiters: VecDeque::new(),
                ping_timer: None,
                last_error: None,
            }),
            flush_cv: Condvar::new(),
            status_cv: Condvar::new(),
            subs: Mutex::new(HashMap::new()),
            next_sid: AtomicU64::new(1),
        });

        let attempts = core.state.lock().unwrap().pool.len();
        let mut last_err = Error::NoServers;
        for _ in 0..attempts {
            let idx = {
                let mut st = core.state.lock().unwrap();
                match st.pool.select_next(None) {
                    Some(idx) => {
                        st.pool.record_attempt(idx);
                        idx
                    }
                    None => break,
                }
            };
            match core.try_server(idx) {
                Ok(established) => {
                    core.install(idx, established, false);
                    return Ok(Connection { core });
                }
                Err(err) => {
                    debug!("connect attempt failed: {err}");
                    last_err = err;
                }
            }
        }
        let mut st = core.state.lock().unwrap();
        st.status = ConnStatus::Closed;
        Err(last_err)
    }

    pub fn status(&self) -> ConnStatus {
        self.core.state.lock().unwrap().status
    }

    pub fn is_closed(&self) -> bool {
        self.status() == ConnStatus::Closed
    }

    /// Last INFO received from the current server.
    pub fn server_info(&self) -> ServerInfo {
        self.core.state.lock().unwrap().server_info.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.core.state.lock().unwrap().last_error.clone()
    }

    /// Known server URLs, seeds plus discovered.
    pub fn servers(&self) -> Vec<String> {
        let st = self.core.state.lock().unwrap();
        st.pool.urls().map(|u| u.addr()).collect()
    }

    pub fn new_inbox(&self) -> String {
        inbox::new_inbox(INBOX_PREFIX)
    }

    pub fn publish(&self, subject: &str, payload: impl AsRef<[u8]>) -> Result<()> {
        self.publish_parts(subject, None, None, payload.as_ref())
    }

    pub fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: impl AsRef<[u8]>,
    ) -> Result<()> {
        subject::check_publish_subject(reply)?;
        self.publish_parts(subject, Some(reply), None, payload.as_ref())
    }

    pub fn publish_with_headers(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.publish_parts(subject, None, Some(headers), payload.as_ref())
    }

    /// Publishes a prebuilt message (subject, optional reply, optional
    /// headers, payload).
    pub fn publish_msg(&self, msg: &Message) -> Result<()> {
        self.publish_parts(
            &msg.subject,
            msg.reply.as_deref(),
            msg.headers.as_ref(),
            &msg.payload,
        )
    }

    pub(crate) fn publish_parts(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: &[u8],
    ) -> Result<()> {
        subject::check_publish_subject(subject)?;
        let core = &self.core;
        let mut st = core.state.lock().unwrap();
        match st.status {
            ConnStatus::Closed | ConnStatus::Disconnected | ConnStatus::Connecting => {
                return Err(Error::ConnectionClosed)
            }
            ConnStatus::DrainingPubs => return Err(Error::Draining),
            _ => {}
        }
        let max_payload = st.server_info.max_payload;
        if max_payload > 0 && payload.len() > max_payload {
            return Err(Error::MaxPayload);
        }
        if headers.is_some() && !st.server_info.headers {
            return Err(Error::InvalidArg("server does not support headers"));
        }

        let mut frame = Vec::with_capacity(payload.len() + 64);
        match headers {
            Some(h) if !h.is_empty() => wire::append_hpub(&mut frame, subject, reply, h, payload),
            _ => wire::append_pub(&mut frame, subject, reply, payload),
        }
        core.append_frame_locked(&mut st, &frame)
    }

    /// Publishes on `subject` with a one-shot reply inbox and waits for
    /// the response.
    pub fn request(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Message> {
        self.request_parts(subject, None, payload.as_ref(), timeout)
    }

    pub fn request_with_headers(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Message> {
        self.request_parts(subject, Some(headers), payload.as_ref(), timeout)
    }

    fn request_parts(
        &self,
        subject: &str,
        headers: Option<&HeaderMap>,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message> {
        let reply = self.new_inbox();
        let sub = self.subscribe_inner(&reply, SubscribeOptions::new(), None)?;
        sub.auto_unsubscribe(1)?;
        self.publish_parts(subject, Some(&reply), headers, payload)?;
        let msg = match sub.next_msg(timeout) {
            Ok(msg) => msg,
            Err(err) => {
                let _ = sub.unsubscribe();
                return Err(err);
            }
        };
        if msg.status() == Some(STATUS_NO_RESPONDERS) {
            return Err(Error::NoResponders);
        }
        Ok(msg)
    }

    /// Synchronous subscription; receive with `next_msg`.
    pub fn subscribe(&self, subject: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, SubscribeOptions::new(), None)
    }

    pub fn queue_subscribe(&self, subject: &str, queue: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, SubscribeOptions::new().queue(queue), None)
    }

    pub fn subscribe_with(&self, subject: &str, opts: SubscribeOptions) -> Result<Subscription> {
        self.subscribe_inner(subject, opts, None)
    }

    /// Callback subscription; `handler` runs on a dispatcher thread.
    pub fn subscribe_handler<F>(&self, subject: &str, handler: F) -> Result<Subscription>
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.subscribe_inner(subject, SubscribeOptions::new(), Some(Box::new(handler)))
    }

    pub fn subscribe_handler_with<F>(
        &self,
        subject: &str,
        opts: SubscribeOptions,
        handler: F,
    ) -> Result<Subscription>
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.subscribe_inner(subject, opts, Some(Box::new(handler)))
    }

    pub(crate) fn subscribe_inner(
        &self,
        subject: &str,
        opts: SubscribeOptions,
        cb: Option<MessageCallback>,
    ) -> Result<Subscription> {
        self.subscribe_js(subject, opts, cb, None)
    }

    /// Subscription creation with optional persistent-stream metadata,
    /// attached before the sid becomes routable.
    pub(crate) fn subscribe_js(
        &self,
        subject: &str,
        opts: SubscribeOptions,
        cb: Option<MessageCallback>,
        js: Option<Box<crate::jetstream::sub::JsSubMeta>>,
    ) -> Result<Subscription> {
        subject::check_subscribe_subject(subject)?;
        if let Some(queue) = &opts.queue {
            subject::check_queue_name(queue)?;
        }
        let core = &self.core;
        let sid = core.next_sid.fetch_add(1, Ordering::Relaxed);
        let mode = match &cb {
            None => DeliverMode::Sync,
            Some(_) => {
                if core.opts.shared_dispatcher && !opts.dedicated_dispatcher {
                    DeliverMode::Pool(dispatch::assign_pool_dispatcher())
                } else {
                    DeliverMode::Dedicated
                }
            }
        };
        let dedicated = matches!(mode, DeliverMode::Dedicated);
        let has_cb = cb.is_some();
        let max_deliveries = opts.max_deliveries;
        let timeout = opts.timeout;
        let sub = SubState::new(
            sid,
            subject.to_string(),
            Arc::downgrade(core),
            &opts,
            cb,
            mode,
        );

        if js.is_some() {
            sub.mu.lock().unwrap().js = js;
        }

        {
            // Map insert and SUB emission are atomic with respect to a
            // concurrent reconnect install, which re-issues interest for
            // everything already in the map.
            let mut st = core.state.lock().unwrap();
            match st.status {
                ConnStatus::Closed => return Err(Error::ConnectionClosed),
                ConnStatus::DrainingSubs | ConnStatus::DrainingPubs => {
                    return Err(Error::Draining)
                }
                _ => {}
            }
            core.subs.lock().unwrap().insert(sid, Arc::clone(&sub));
            if st.status != ConnStatus::Reconnecting {
                let mut frame = Vec::with_capacity(64);
                wire::append_sub(&mut frame, subject, opts.queue.as_deref(), sid);
                if let Some(max) = max_deliveries {
                    wire::append_unsub(&mut frame, sid, Some(max));
                }
                core.append_frame_locked(&mut st, &frame)?;
            }
        }

        if dedicated {
            dispatch::spawn_dedicated(Arc::clone(&sub));
        }
        let handle = Subscription::new(sub);
        if has_cb && timeout.is_some() {
            handle.arm_timeout();
        }
        Ok(handle)
    }

    /// PING/PONG barrier with the default timeout.
    pub fn flush(&self) -> Result<()> {
        self.flush_timeout(DEFAULT_FLUSH_TIMEOUT)
    }

    pub fn flush_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::InvalidTimeout);
        }
        let deadline = Instant::now() + timeout;
        let waiter = PongWaiter::new();
        {
            let core = &self.core;
            let mut st = core.state.lock().unwrap();
            match st.status {
                ConnStatus::Closed => return Err(Error::ConnectionClosed),
                ConnStatus::Connected
                | ConnStatus::DrainingSubs
                | ConnStatus::DrainingPubs
                | ConnStatus::Reconnecting => {}
                _ => return Err(Error::ConnectionClosed),
            }
            st.pong_waiters.push_back(Arc::clone(&waiter));
            core.append_frame_locked(&mut st, wire::PING_FRAME)?;
        }
        waiter.wait(deadline)
    }

    /// Gracefully drains every subscription, flushes pending publishes,
    /// then closes.
    pub fn drain(&self) -> Result<()> {
        self.drain_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn drain_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        {
            let mut st = self.core.state.lock().unwrap();
            match st.status {
                ConnStatus::Closed => return Err(Error::ConnectionClosed),
                ConnStatus::DrainingSubs | ConnStatus::DrainingPubs => {
                    return Err(Error::Draining)
                }
                _ => {}
            }
            st.status = ConnStatus::DrainingSubs;
        }
        let subs: Vec<Arc<SubState>> =
            self.core.subs.lock().unwrap().values().cloned().collect();
        for sub in &subs {
            let _ = Subscription::new(Arc::clone(sub)).drain();
        }
        for sub in &subs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let _ = Subscription::new(Arc::clone(sub)).wait_for_drain_completion(remaining);
        }
        {
            let mut st = self.core.state.lock().unwrap();
            if st.status == ConnStatus::DrainingSubs {
                st.status = ConnStatus::DrainingPubs;
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            let _ = self.flush_timeout(remaining);
        }
        self.close();
        Ok(())
    }

    /// Closes the connection immediately. Queued messages are dropped and
    /// every subscription is closed.
    pub fn close(&self) {
        self.core.do_close(true);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.core.state.lock().unwrap();
        f.debug_struct("Connection")
            .field("status", &st.status)
            .field("server", &st.server_info.server_id)
            .finish()
    }
}

/// Everything a successful handshake produced.
pub(crate) struct Established {
    stream: Arc<TcpStream>,
    info: ServerInfo,
    parser: Parser,
    leftover: Vec<ServerOp>,
}

impl ConnCore {
    /// Appends a frame to the active outbound buffer, or to the reconnect
    /// buffer when disconnected. Caller holds the state lock.
    pub(crate) fn append_frame_locked(&self, st: &mut ConnState, frame: &[u8]) -> Result<()> {
        match st.status {
            ConnStatus::Closed => return Err(Error::ConnectionClosed),
            ConnStatus::Reconnecting => {
                let pending = st.pending.get_or_insert_with(Vec::new);
                if pending.len() + frame.len() > self.opts.reconnect_buf_size {
                    return Err(Error::ConnectionClosed);
                }
                pending.extend_from_slice(frame);
                return Ok(());
            }
            _ => {}
        }
        let was_empty = st.out_buf.is_empty();
        st.out_buf.extend_from_slice(frame);
        if was_empty {
            self.flush_cv.notify_one();
        }
        Ok(())
    }

    pub(crate) fn append_frame(&self, frame: &[u8]) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.append_frame_locked(&mut st, frame)
    }

    pub(crate) fn send_unsub(&self, sid: u64, max: Option<u64>) -> Result<()> {
        let mut frame = Vec::with_capacity(32);
        wire::append_unsub(&mut frame, sid, max);
        self.append_frame(&frame)
    }

    pub(crate) fn remove_sub(&self, sid: u64) {
        self.subs.lock().unwrap().remove(&sid);
    }

    /// Atomically re-keys a subscription under a fresh sid and subject:
    /// the routing entry moves, and an UNSUB for the old sid plus a SUB
    /// for the new one go out in a single frame. Used by ordered-consumer
    /// recreation.
    pub(crate) fn swap_sid(&self, sub: &Arc<SubState>, new_subject: &str) -> Result<u64> {
        let mut st = self.state.lock().unwrap();
        if st.status == ConnStatus::Closed {
            return Err(Error::ConnectionClosed);
        }
        let new_sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        {
            let mut subs = self.subs.lock().unwrap();
            let old_sid = sub.sid.swap(new_sid, Ordering::SeqCst);
            subs.remove(&old_sid);
            subs.insert(new_sid, Arc::clone(sub));
            *sub.subject.lock().unwrap() = new_subject.to_string();

            let mut frame = Vec::with_capacity(64);
            wire::append_unsub(&mut frame, old_sid, None);
            wire::append_sub(&mut frame, new_subject, None, new_sid);
            self.append_frame_locked(&mut st, &frame)?;
        }
        Ok(new_sid)
    }

    pub(crate) fn post_sub_error(self: &Arc<Self>, sub: Arc<SubState>, err: Error) {
        let Some(cb) = self.opts.error_cb.clone() else {
            warn!("subscription {} error: {err}", sub.id());
            return;
        };
        let core = Arc::clone(self);
        crate::events::post(move || {
            let conn = Connection::from_core(core);
            let sub = Subscription::new(sub);
            cb(&conn, Some(&sub), &err);
        });
    }

    pub(crate) fn post_conn_error(self: &Arc<Self>, err: Error) {
        let Some(cb) = self.opts.error_cb.clone() else {
            warn!("connection error: {err}");
            return;
        };
        let core = Arc::clone(self);
        crate::events::post(move || {
            let conn = Connection::from_core(core);
            cb(&conn, None, &err);
        });
    }

    fn post_event(self: &Arc<Self>, cb: Option<crate::options::ConnectionHandler>) {
        let Some(cb) = cb else { return };
        let core = Arc::clone(self);
        crate::events::post(move || {
            let conn = Connection::from_core(core);
            cb(&conn);
        });
    }

    /// Dials and handshakes one pool entry.
    fn try_server(self: &Arc<Self>, idx: usize) -> Result<Established> {
        let url = {
            let st = self.state.lock().unwrap();
            st.pool.entry(idx).url.clone()
        };
        if url.scheme == Scheme::Tls {
            return Err(Error::SecureConnectionRequired);
        }
        let opts = &self.opts;
        let deadline = Instant::now() + opts.connect_timeout;

        let mut last_err: Option<std::io::Error> = None;
        let addrs = url
            .addr()
            .to_socket_addrs()
            .map_err(Error::Io)?
            .collect::<Vec<_>>();
        let mut stream = None;
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match stream {
            Some(s) => s,
            None => {
                return Err(last_err
                    .map(Error::Io)
                    .unwrap_or(Error::NoServers))
            }
        };
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(opts.connect_timeout))?;
        if let Some(deadline) = opts.write_deadline {
            stream.set_write_timeout(Some(deadline))?;
        }

        let mut parser = Parser::new();
        let mut ops = Vec::new();
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut reader = &stream;

        // Wait for INFO.
        let info = loop {
            if let Some(pos) = ops.iter().position(|op| matches!(op, ServerOp::Info(_))) {
                let ServerOp::Info(json) = ops.remove(pos) else {
                    unreachable!()
                };
                let info: ServerInfo = serde_json::from_str(&json)
                    .map_err(|e| Error::Protocol(format!("bad INFO payload: {e}")))?;
                break info;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Err(Error::ConnectionDisconnected);
            }
            parser.parse(&buf[..n], &mut ops)?;
        };
        if info.tls_required {
            return Err(Error::SecureConnectionRequired);
        }

        // CONNECT + PING, then wait for PONG (or -ERR).
        let mut req = ConnectRequest {
            verbose: opts.verbose,
            pedantic: opts.pedantic,
            name: opts.name.clone(),
            echo: !opts.no_echo,
            ..ConnectRequest::default()
        };
        match (&url.user, &url.pass) {
            (Some(user), Some(pass)) => {
                req.user = Some(user.clone());
                req.pass = Some(pass.clone());
            }
            (Some(token), None) => req.auth_token = Some(token.clone()),
            _ => {
                req.user = opts.user.clone();
                req.pass = opts.password.clone();
                if req.user.is_none() {
                    req.auth_token = opts.token.clone();
                }
            }
        }
        let mut hello = Vec::with_capacity(256);
        wire::append_connect(&mut hello, &req);
        hello.extend_from_slice(wire::PING_FRAME);
        (&stream).write_all(&hello)?;

        loop {
            if let Some(pos) = ops
                .iter()
                .position(|op| matches!(op, ServerOp::Pong | ServerOp::Err(_)))
            {
                match ops.remove(pos) {
                    ServerOp::Pong => break,
                    ServerOp::Err(reason) => return Err(map_server_error(&reason)),
                    _ => unreachable!(),
                }
            }
            // +OK under verbose is consumed silently.
            ops.retain(|op| !matches!(op, ServerOp::Ok));
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Err(Error::ConnectionDisconnected);
            }
            parser.parse(&buf[..n], &mut ops)?;
        }

        stream.set_read_timeout(None)?;
        Ok(Established {
            stream: Arc::new(stream),
            info,
            parser,
            leftover: ops,
        })
    }

    /// Installs an established socket, spawns its reader and flusher, and
    /// arms the ping timer. On reconnect, re-issues SUB protos and the
    /// buffered publishes.
    fn install(self: &Arc<Self>, idx: usize, established: Established, reconnect: bool) {
        let Established {
            stream,
            info,
            parser,
            leftover,
        } = established;

        let gen = {
            let mut st = self.state.lock().unwrap();
            st.gen += 1;
            let gen = st.gen;
            st.stream = Some(Arc::clone(&stream));
            st.server_info = info;
            st.status = ConnStatus::Connected;
            st.pings_out = 0;
            st.pool.record_success(idx);

            if reconnect {
                // Interest first, then the replayed publishes.
                let mut frames = Vec::new();
                for sub in self.subs.lock().unwrap().values() {
                    let inner = sub.mu.lock().unwrap();
                    if inner.closed || inner.draining {
                        continue;
                    }
                    wire::append_sub(
                        &mut frames,
                        &sub.subject.lock().unwrap(),
                        sub.queue_group.as_deref(),
                        sub.id(),
                    );
                    if let Some(max) = inner.max_deliveries {
                        let remaining = max.saturating_sub(inner.delivered);
                        if remaining > 0 {
                            wire::append_unsub(&mut frames, sub.id(), Some(remaining));
                        }
                    }
                }
                st.out_buf = frames;
                if let Some(pending) = st.pending.take() {
                    st.out_buf.extend_from_slice(&pending);
                }
            }

            let urls = st.server_info.connect_urls.clone();
            let added = st.pool.merge_discovered(&urls);
            if !added.is_empty() {
                info!("discovered {} new servers", added.len());
                self.post_event(self.opts.discovered_servers_cb.clone());
            }
            if !st.out_buf.is_empty() {
                self.flush_cv.notify_one();
            }
            gen
        };

        // Reader.
        {
            let core = Arc::clone(self);
            let stream = Arc::clone(&stream);
            std::thread::Builder::new()
                .name("weft-reader".to_string())
                .spawn(move || core.reader_loop(stream, parser, leftover, gen))
                .expect("spawn reader thread");
        }
        // Flusher.
        {
            let core = Arc::clone(self);
            std::thread::Builder::new()
                .name("weft-flusher".to_string())
                .spawn(move || core.flusher_loop(gen))
                .expect("spawn flusher thread");
        }
        // Ping liveness.
        {
            let core = Arc::downgrade(self);
            let interval = self.opts.ping_interval;
            let timer = Timer::start(interval, Some(interval), move || {
                if let Some(core) = core.upgrade() {
                    core.ping_tick(gen);
                }
            });
            let mut st = self.state.lock().unwrap();
            if let Some(old) = st.ping_timer.take() {
                old.stop();
            }
            st.ping_timer = Some(timer);
        }
    }

    fn ping_tick(self: &Arc<Self>, gen: u64) {
        let stale = {
            let mut st = self.state.lock().unwrap();
            if st.gen != gen || st.status != ConnStatus::Connected {
                return;
            }
            st.pings_out += 1;
            if st.pings_out > self.opts.max_pings_out {
                true
            } else {
                let _ = self.append_frame_locked(&mut st, wire::PING_FRAME);
                false
            }
        };
        if stale {
            debug!("stale connection: {} pings outstanding", self.opts.max_pings_out);
            self.process_op_error(Error::StaleConnection, gen);
        }
    }

    fn reader_loop(
        self: Arc<Self>,
        stream: Arc<TcpStream>,
        mut parser: Parser,
        mut ops: Vec<ServerOp>,
        gen: u64,
    ) {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            for op in ops.drain(..) {
                self.handle_op(op, gen);
            }
            if self.gen_is_stale(gen) {
                return;
            }
            match (&*stream).read(&mut buf) {
                Ok(0) => {
                    self.process_op_error(
                        Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "server closed connection",
                        )),
                        gen,
                    );
                    return;
                }
                Ok(n) => {
                    if let Err(err) = parser.parse(&buf[..n], &mut ops) {
                        self.post_conn_error(Error::Protocol(err.to_string()));
                        self.process_op_error(err, gen);
                        return;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.process_op_error(Error::Io(err), gen);
                    return;
                }
            }
        }
    }

    fn flusher_loop(self: Arc<Self>, gen: u64) {
        loop {
            let (chunk, stream) = {
                let mut st = self.state.lock().unwrap();
                loop {
                    if st.gen != gen || st.status == ConnStatus::Closed {
                        return;
                    }
                    if !st.out_buf.is_empty() {
                        break;
                    }
                    st = self.flush_cv.wait(st).unwrap();
                }
                let chunk = std::mem::take(&mut st.out_buf);
                let Some(stream) = st.stream.clone() else { return };
                (chunk, stream)
            };
            if let Err(err) = (&*stream).write_all(&chunk) {
                self.process_op_error(Error::Io(err), gen);
                return;
            }
        }
    }

    fn gen_is_stale(&self, gen: u64) -> bool {
        let st = self.state.lock().unwrap();
        st.gen != gen || st.status == ConnStatus::Closed
    }

    fn handle_op(self: &Arc<Self>, op: ServerOp, gen: u64) {
        match op {
            ServerOp::Msg { args, payload } => {
                let sub = self.subs.lock().unwrap().get(&args.sid).cloned();
                let Some(sub) = sub else {
                    // Interest already removed; the tail of deliveries is
                    // dropped silently.
                    return;
                };
                let (headers, status, body) = if args.hdr_len > 0 {
                    match HeaderMap::parse(&payload[..args.hdr_len]) {
                        Ok((headers, status)) => {
                            (Some(headers), status, payload[args.hdr_len..].to_vec())
                        }
                        Err(err) => {
                            self.post_conn_error(err);
                            return;
                        }
                    }
                } else {
                    (None, None, payload)
                };
                let msg = Message::inbound(args.subject, args.reply, headers, status, body);
                sub.enqueue_msg(msg);
            }
            ServerOp::Ping => {
                let _ = self.append_frame(wire::PONG_FRAME);
            }
            ServerOp::Pong => {
                let waiter = {
                    let mut st = self.state.lock().unwrap();
                    st.pings_out = 0;
                    st.pong_waiters.pop_front()
                };
                if let Some(waiter) = waiter {
                    waiter.complete(PongOutcome::Done);
                }
            }
            ServerOp::Ok => {}
            ServerOp::Info(json) => match serde_json::from_str::<ServerInfo>(&json) {
                Ok(info) => {
                    let mut st = self.state.lock().unwrap();
                    let urls = info.connect_urls.clone();
                    st.server_info = info;
                    let added = st.pool.merge_discovered(&urls);
                    drop(st);
                    if !added.is_empty() {
                        self.post_event(self.opts.discovered_servers_cb.clone());
                    }
                }
                Err(err) => {
                    self.post_conn_error(Error::Protocol(format!("bad INFO payload: {err}")))
                }
            },
            ServerOp::Err(reason) => self.handle_server_error(reason, gen),
        }
    }

    fn handle_server_error(self: &Arc<Self>, reason: String, gen: u64) {
        let lower = reason.to_ascii_lowercase();
        {
            let mut st = self.state.lock().unwrap();
            st.last_error = Some(reason.clone());
        }
        if lower.contains("stale connection") {
            self.process_op_error(Error::StaleConnection, gen);
        } else if lower.contains("authorization violation")
            || lower.contains("user authentication")
        {
            self.post_conn_error(Error::Authorization(reason));
            self.do_close(true);
        } else if lower.contains("permissions violation") {
            // Scoped to a subject; the connection stays up.
            self.post_conn_error(Error::NotPermitted(reason));
        } else if lower.contains("maximum payload") {
            self.post_conn_error(Error::MaxPayload);
        } else if lower.contains("slow consumer") {
            self.post_conn_error(Error::SlowConsumer);
        } else {
            self.post_conn_error(Error::Server(reason));
            self.process_op_error(Error::ConnectionDisconnected, gen);
        }
    }

    /// Entry point for every socket-level failure. Converts retriable
    /// conditions into a reconnect cycle, everything else into a close.
    pub(crate) fn process_op_error(self: &Arc<Self>, err: Error, gen: u64) {
        let reconnect = {
            let mut st = self.state.lock().unwrap();
            if st.gen != gen
                || matches!(st.status, ConnStatus::Closed | ConnStatus::Reconnecting)
            {
                return;
            }
            if self.opts.allow_reconnect
                && matches!(st.status, ConnStatus::Connected | ConnStatus::DrainingSubs)
            {
                st.status = ConnStatus::Reconnecting;
                st.gen += 1;
                if let Some(stream) = st.stream.take() {
                    let _ = stream.shutdown(Shutdown::Both);
                }
                if let Some(timer) = st.ping_timer.take() {
                    timer.stop();
                }
                st.last_error = Some(err.to_string());
                let out = std::mem::take(&mut st.out_buf);
                let pending = st.pending.get_or_insert_with(Vec::new);
                if pending.len() + out.len() <= self.opts.reconnect_buf_size {
                    pending.extend_from_slice(&out);
                }
                for waiter in st.pong_waiters.drain(..) {
                    waiter.complete(PongOutcome::Disconnected);
                }
                true
            } else {
                false
            }
        };
        if reconnect {
            warn!("connection lost ({err}), reconnecting");
            self.flush_cv.notify_all();
            self.post_event(self.opts.disconnected_cb.clone());
            let core = Arc::clone(self);
            std::thread::Builder::new()
                .name("weft-reconnect".to_string())
                .spawn(move || core.reconnect_loop())
                .expect("spawn reconnect thread");
        } else {
            self.do_close(true);
        }
    }

    fn reconnect_loop(self: Arc<Self>) {
        loop {
            let idx = {
                let mut st = self.state.lock().unwrap();
                if st.status != ConnStatus::Reconnecting {
                    return;
                }
                st.pool.select_next(self.opts.max_reconnect)
            };
            let Some(idx) = idx else {
                info!("no servers left to try, closing");
                self.do_close(true);
                return;
            };
            let delay = {
                let st = self.state.lock().unwrap();
                st.pool
                    .backoff(idx, self.opts.reconnect_wait, self.opts.reconnect_jitter)
            };
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            {
                let mut st = self.state.lock().unwrap();
                if st.status != ConnStatus::Reconnecting {
                    return;
                }
                st.pool.record_attempt(idx);
            }
            match self.try_server(idx) {
                Ok(established) => {
                    {
                        let st = self.state.lock().unwrap();
                        if st.status != ConnStatus::Reconnecting {
                            return;
                        }
                    }
                    self.install(idx, established, true);
                    info!("reconnected");
                    self.post_event(self.opts.reconnected_cb.clone());
                    return;
                }
                Err(err) => {
                    debug!("reconnect attempt failed: {err}");
                    let mut st = self.state.lock().unwrap();
                    st.last_error = Some(err.to_string());
                }
            }
        }
    }

    pub(crate) fn do_close(self: &Arc<Self>, fire_closed: bool) {
        {
            let mut st = self.state.lock().unwrap();
            if st.status == ConnStatus::Closed {
                return;
            }
            st.status = ConnStatus::Closed;
            st.gen += 1;
            if let Some(timer) = st.ping_timer.take() {
                timer.stop();
            }
            if let Some(stream) = st.stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            st.pending = None;
            st.out_buf.clear();
            for waiter in st.pong_waiters.drain(..) {
                waiter.complete(PongOutcome::Closed);
            }
        }
        self.flush_cv.notify_all();
        self.status_cv.notify_all();

        let subs: Vec<Arc<SubState>> = {
            let mut subs = self.subs.lock().unwrap();
            subs.drain().map(|(_, sub)| sub).collect()
        };
        for sub in subs {
            {
                let mut inner = sub.mu.lock().unwrap();
                if inner.closed {
                    continue;
                }
                inner.connection_closed = true;
            }
            sub.push_item_locked(ItemKind::Close);
            sub.cv.notify_all();
        }

        if fire_closed {
            self.post_event(self.opts.closed_cb.clone());
        }
    }
}

fn map_server_error(reason: &str) -> Error {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("authorization") || lower.contains("user authentication") {
        Error::Authorization(reason.to_string())
    } else if lower.contains("secure connection") || lower.contains("tls required") {
        Error::SecureConnectionRequired
    } else {
        Error::Server(reason.to_string())
    }
}
