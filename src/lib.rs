//! Thread-based client for NATS-style messaging fabrics.
//!
//! The client keeps one long-lived TCP connection to a broker cluster,
//! publishes on hierarchical subjects, and receives through
//! subscriptions, either synchronously or via dispatcher callbacks. A
//! persistent-stream layer ([`jetstream`]) adds acknowledged publishes
//! and durable push/pull/ordered consumers on top of the same transport.
//!
//! ```no_run
//! let nc = weft::connect("nats://127.0.0.1:4222")?;
//! let sub = nc.subscribe("greet.*")?;
//! nc.publish("greet.joe", "hello")?;
//! let msg = sub.next_msg(std::time::Duration::from_secs(1))?;
//! assert_eq!(msg.payload, b"hello");
//! # Ok::<(), weft::Error>(())
//! ```

pub mod error;
pub mod headers;
pub mod jetstream;
pub mod service;
pub mod subject;

mod connection;
mod dispatch;
mod events;
mod inbox;
mod message;
mod options;
mod parser;
mod servers;
mod subscription;
mod timer;
mod wire;

pub use connection::{connect, ConnStatus, Connection};
pub use error::{ApiError, Error, Result};
pub use headers::{HeaderMap, HeaderStatus};
pub use jetstream::{JetStream, JetStreamOptions, PublishAsyncError, PublishOptions};
pub use message::Message;
pub use options::{Options, SubscribeOptions};
pub use subscription::Subscription;
pub use wire::ServerInfo;
