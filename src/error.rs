use thiserror::Error;

/// Error raised by a persistent-stream management API call.
///
/// Mirrors the `error` object of the server's response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("server error {code} ({err_code}): {description}")]
pub struct ApiError {
    /// HTTP-like status code.
    pub code: u16,
    /// Server-specific error code.
    pub err_code: u32,
    pub description: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("invalid subject")]
    InvalidSubject,

    #[error("invalid subscription")]
    InvalidSubscription,

    #[error("invalid timeout")]
    InvalidTimeout,

    #[error("timeout")]
    Timeout,

    #[error("no responders available for request")]
    NoResponders,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection reconnecting")]
    ConnectionReconnecting,

    #[error("connection disconnected")]
    ConnectionDisconnected,

    #[error("slow consumer, messages dropped")]
    SlowConsumer,

    #[error("stale connection")]
    StaleConnection,

    #[error("secure connection required")]
    SecureConnectionRequired,

    #[error("maximum payload exceeded")]
    MaxPayload,

    #[error("maximum deliveries reached")]
    MaxDeliveredMsgs,

    #[error("limit reached")]
    LimitReached,

    #[error("no servers available for connection")]
    NoServers,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("permissions violation: {0}")]
    NotPermitted(String),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("not found")]
    NotFound,

    #[error("configuration mismatch: {0}")]
    Mismatch(String),

    #[error("missed heartbeat")]
    MissedHeartbeat,

    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error("server error: {0}")]
    Server(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("draining in progress")]
    Draining,
}

impl Error {
    /// True for conditions that a reconnect cycle may clear.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::StaleConnection
                | Error::ConnectionDisconnected
                | Error::ConnectionReconnecting
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display() {
        let err = ApiError {
            code: 404,
            err_code: 10059,
            description: "stream not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "server error 404 (10059): stream not found"
        );
    }

    #[test]
    fn io_error_source_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err = Error::from(io);
        assert!(err.is_retriable());
        assert!(std::error::Error::source(&err).is_some());
    }
}
