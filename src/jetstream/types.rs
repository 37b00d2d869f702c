//! Persistent-stream management API types.
//!
//! JSON shapes for the request/reply management API. Field names and
//! enum spellings follow the server; unknown response fields are ignored.

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, Error, Result};

/// Stream configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub max_consumers: i64,
    #[serde(default)]
    pub max_msgs: i64,
    #[serde(default)]
    pub max_bytes: i64,
    #[serde(default)]
    pub discard: DiscardPolicy,
    /// Nanoseconds; 0 means unlimited.
    #[serde(default)]
    pub max_age: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_msg_size: Option<i32>,
    #[serde(default)]
    pub storage: StorageType,
    #[serde(default = "default_replicas")]
    pub num_replicas: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_ack: Option<bool>,
    /// Nanoseconds the server keeps message IDs for dedup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_window: Option<i64>,
}

fn default_replicas() -> usize {
    1
}

impl From<&str> for StreamConfig {
    fn from(name: &str) -> StreamConfig {
        StreamConfig {
            name: name.to_string(),
            num_replicas: 1,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    #[serde(rename = "workqueue")]
    WorkQueue,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    #[default]
    Old,
    New,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
    ByStartSequence,
    ByStartTime,
    LastPerSubject,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    None,
    All,
    #[default]
    Explicit,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

/// Consumer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConsumerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_group: Option<String>,
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    /// RFC 3339 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_time: Option<String>,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    /// Nanoseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_wait: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,
    /// Redelivery backoff steps, nanoseconds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backoff: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_subjects: Vec<String>,
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_bps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_freq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_waiting: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub flow_control: bool,
    /// Nanoseconds between server idle heartbeats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_heartbeat: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub headers_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch: Option<i64>,
    /// Nanoseconds cap on pull request expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_expires: Option<i64>,
    /// Nanoseconds of inactivity before the server reaps the consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_threshold: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_replicas: Option<usize>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mem_storage: bool,
}

impl From<&str> for ConsumerConfig {
    fn from(durable: &str) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: Some(durable.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequencePair {
    #[serde(default)]
    pub consumer_seq: u64,
    #[serde(default)]
    pub stream_seq: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamState {
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub first_seq: u64,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub consumer_count: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub state: StreamState,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumerInfo {
    #[serde(default)]
    pub stream_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created: String,
    pub config: ConsumerConfig,
    #[serde(default)]
    pub delivered: SequencePair,
    #[serde(default)]
    pub ack_floor: SequencePair,
    #[serde(default)]
    pub num_ack_pending: usize,
    #[serde(default)]
    pub num_redelivered: usize,
    #[serde(default)]
    pub num_waiting: usize,
    #[serde(default)]
    pub num_pending: u64,
}

/// Acknowledgement for a stream publish.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PubAck {
    pub stream: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateConsumerRequest<'a> {
    pub stream_name: &'a str,
    pub config: &'a ConsumerConfig,
}

/// Pull request for the next batch of messages.
#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct NextRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    pub batch: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_wait: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_heartbeat: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct StreamNamesRequest<'a> {
    pub subject: &'a str,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamNamesResponse {
    #[serde(default)]
    pub streams: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MsgDeleteRequest {
    pub seq: u64,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SuccessResponse {
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    err_code: u32,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

/// Decodes a management API response envelope: either the expected value
/// or an `{"error": ...}` body.
pub(crate) fn decode_api_response<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    if let Ok(env) = serde_json::from_slice::<ApiErrorEnvelope>(payload) {
        let body = env.error;
        return Err(Error::Api(ApiError {
            code: body.code,
            err_code: body.err_code,
            description: body.description,
        }));
    }
    serde_json::from_slice::<T>(payload)
        .map_err(|e| Error::Protocol(format!("bad api response: {e}")))
}
