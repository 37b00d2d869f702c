//! Connection and subscription configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::subscription::Subscription;

/// Callback invoked with the connection on lifecycle transitions.
pub type ConnectionHandler = Arc<dyn Fn(&Connection) + Send + Sync>;
/// Callback invoked for asynchronous errors. The subscription is present
/// when the error is scoped to one (slow consumer, missed heartbeat, ...).
pub type ErrorHandler = Arc<dyn Fn(&Connection, Option<&Subscription>, &Error) + Send + Sync>;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
pub(crate) const DEFAULT_MAX_PINGS_OUT: u32 = 2;
pub(crate) const DEFAULT_MAX_RECONNECT: u32 = 60;
pub(crate) const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_RECONNECT_BUF_SIZE: usize = 8 * 1024 * 1024;
pub(crate) const DEFAULT_SUB_PENDING_MSGS: usize = 65536;
pub(crate) const DEFAULT_SUB_PENDING_BYTES: usize = 64 * 1024 * 1024;

/// Connection options: a plain struct with chained setters. `connect`
/// consumes it.
#[derive(Clone)]
pub struct Options {
    pub(crate) servers: Vec<String>,
    pub(crate) name: Option<String>,
    pub(crate) verbose: bool,
    pub(crate) pedantic: bool,
    pub(crate) no_echo: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) max_pings_out: u32,
    pub(crate) allow_reconnect: bool,
    pub(crate) max_reconnect: Option<u32>,
    pub(crate) reconnect_wait: Duration,
    pub(crate) reconnect_jitter: Duration,
    /// Cap on publishes buffered while reconnecting.
    pub(crate) reconnect_buf_size: usize,
    pub(crate) no_randomize: bool,
    pub(crate) user: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) token: Option<String>,
    /// Socket write deadline applied by the flusher.
    pub(crate) write_deadline: Option<Duration>,
    /// Deliver async-subscription messages through the shared worker pool
    /// instead of one thread per subscription.
    pub(crate) shared_dispatcher: bool,
    pub(crate) disconnected_cb: Option<ConnectionHandler>,
    pub(crate) reconnected_cb: Option<ConnectionHandler>,
    pub(crate) closed_cb: Option<ConnectionHandler>,
    pub(crate) discovered_servers_cb: Option<ConnectionHandler>,
    pub(crate) error_cb: Option<ErrorHandler>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            servers: Vec::new(),
            name: None,
            verbose: false,
            pedantic: false,
            no_echo: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_pings_out: DEFAULT_MAX_PINGS_OUT,
            allow_reconnect: true,
            max_reconnect: Some(DEFAULT_MAX_RECONNECT),
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
            reconnect_buf_size: DEFAULT_RECONNECT_BUF_SIZE,
            no_randomize: false,
            user: None,
            password: None,
            token: None,
            write_deadline: default_write_deadline(),
            shared_dispatcher: default_shared_dispatcher(),
            disconnected_cb: None,
            reconnected_cb: None,
            closed_cb: None,
            discovered_servers_cb: None,
            error_cb: None,
        }
    }
}

fn default_write_deadline() -> Option<Duration> {
    std::env::var("NATS_DEFAULT_LIB_WRITE_DEADLINE")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn default_shared_dispatcher() -> bool {
    std::env::var_os("NATS_DEFAULT_TO_LIB_MSG_DELIVERY").is_some()
        || std::env::var("NATS_USE_THREAD_POOL")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false)
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(mut self, url: impl Into<String>) -> Self {
        self.servers.push(url.into());
        self
    }

    pub fn servers<S: AsRef<str>>(mut self, urls: &[S]) -> Self {
        self.servers
            .extend(urls.iter().map(|u| u.as_ref().to_string()));
        self
    }

    /// Connection name reported to the server in CONNECT.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn verbose(mut self, on: bool) -> Self {
        self.verbose = on;
        self
    }

    pub fn pedantic(mut self, on: bool) -> Self {
        self.pedantic = on;
        self
    }

    /// Disables receiving own published messages on matching subscriptions.
    pub fn no_echo(mut self, on: bool) -> Self {
        self.no_echo = on;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn max_pings_out(mut self, max: u32) -> Self {
        self.max_pings_out = max;
        self
    }

    pub fn allow_reconnect(mut self, on: bool) -> Self {
        self.allow_reconnect = on;
        self
    }

    /// Maximum consecutive reconnect attempts per pool entry. `None`
    /// retries forever.
    pub fn max_reconnect(mut self, max: Option<u32>) -> Self {
        self.max_reconnect = max;
        self
    }

    pub fn reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    pub fn reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    pub fn reconnect_buf_size(mut self, bytes: usize) -> Self {
        self.reconnect_buf_size = bytes;
        self
    }

    /// Keeps the server pool in the given order instead of shuffling.
    pub fn no_randomize(mut self, on: bool) -> Self {
        self.no_randomize = on;
        self
    }

    pub fn user_pass(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn write_deadline(mut self, deadline: Duration) -> Self {
        self.write_deadline = Some(deadline);
        self
    }

    pub fn shared_dispatcher(mut self, on: bool) -> Self {
        self.shared_dispatcher = on;
        self
    }

    pub fn disconnected_callback(mut self, cb: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.disconnected_cb = Some(Arc::new(cb));
        self
    }

    pub fn reconnected_callback(mut self, cb: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.reconnected_cb = Some(Arc::new(cb));
        self
    }

    pub fn closed_callback(mut self, cb: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.closed_cb = Some(Arc::new(cb));
        self
    }

    pub fn discovered_servers_callback(
        mut self,
        cb: impl Fn(&Connection) + Send + Sync + 'static,
    ) -> Self {
        self.discovered_servers_cb = Some(Arc::new(cb));
        self
    }

    pub fn error_callback(
        mut self,
        cb: impl Fn(&Connection, Option<&Subscription>, &Error) + Send + Sync + 'static,
    ) -> Self {
        self.error_cb = Some(Arc::new(cb));
        self
    }

    /// Opens the connection.
    pub fn connect(self) -> Result<Connection> {
        Connection::connect_with_options(self)
    }
}

/// Per-subscription options.
#[derive(Clone)]
pub struct SubscribeOptions {
    pub(crate) queue: Option<String>,
    pub(crate) pending_msgs_limit: usize,
    pub(crate) pending_bytes_limit: usize,
    /// Auto-unsubscribe after this many deliveries.
    pub(crate) max_deliveries: Option<u64>,
    /// Inactivity timeout between deliveries for callback subscriptions.
    pub(crate) timeout: Option<Duration>,
    pub(crate) on_complete: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Force a dedicated dispatcher thread regardless of connection default.
    pub(crate) dedicated_dispatcher: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            queue: None,
            pending_msgs_limit: DEFAULT_SUB_PENDING_MSGS,
            pending_bytes_limit: DEFAULT_SUB_PENDING_BYTES,
            max_deliveries: None,
            timeout: None,
            on_complete: None,
            dedicated_dispatcher: false,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, group: impl Into<String>) -> Self {
        self.queue = Some(group.into());
        self
    }

    /// Pending limits; a non-positive limit is invalid.
    pub fn pending_limits(mut self, msgs: usize, bytes: usize) -> Result<Self> {
        if msgs == 0 || bytes == 0 {
            return Err(Error::InvalidArg("pending limits must be positive"));
        }
        self.pending_msgs_limit = msgs;
        self.pending_bytes_limit = bytes;
        Ok(self)
    }

    pub fn max_deliveries(mut self, max: u64) -> Self {
        self.max_deliveries = Some(max);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_complete(mut self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(cb));
        self
    }

    pub fn dedicated_dispatcher(mut self, on: bool) -> Self {
        self.dedicated_dispatcher = on;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = Options::new();
        assert!(opts.allow_reconnect);
        assert_eq!(opts.max_reconnect, Some(DEFAULT_MAX_RECONNECT));
        assert_eq!(opts.ping_interval, DEFAULT_PING_INTERVAL);
        assert_eq!(opts.reconnect_buf_size, DEFAULT_RECONNECT_BUF_SIZE);
    }

    #[test]
    fn pending_limits_validated() {
        assert!(SubscribeOptions::new().pending_limits(0, 1).is_err());
        assert!(SubscribeOptions::new().pending_limits(10, 1024).is_ok());
    }
}
