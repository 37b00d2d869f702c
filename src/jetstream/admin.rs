//! Stream and consumer administration.
//!
//! Thin request/response wrappers over the management API subjects
//! (`STREAM.CREATE.<name>`, `CONSUMER.INFO.<stream>.<name>`, ...).

use crate::error::{Error, Result};
use crate::headers::STATUS_NO_MESSAGES;
use crate::message::Message;

use super::types::{
    ConsumerConfig, ConsumerInfo, CreateConsumerRequest, MsgDeleteRequest, StreamConfig,
    StreamInfo, StreamNamesRequest, StreamNamesResponse, SuccessResponse,
};
use super::JetStream;

/// Stream and consumer names are single tokens.
pub(crate) fn check_entity_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name
            .bytes()
            .any(|b| matches!(b, b'.' | b' ' | b'\t' | b'*' | b'>' | b'\r' | b'\n'))
    {
        return Err(Error::InvalidArg("invalid stream or consumer name"));
    }
    Ok(())
}

impl JetStream {
    pub fn add_stream(&self, config: &StreamConfig) -> Result<StreamInfo> {
        check_entity_name(&config.name)?;
        let payload = serde_json::to_vec(config)
            .map_err(|e| Error::Protocol(format!("bad stream config: {e}")))?;
        self.ctx
            .api_request(&format!("STREAM.CREATE.{}", config.name), payload)
    }

    pub fn update_stream(&self, config: &StreamConfig) -> Result<StreamInfo> {
        check_entity_name(&config.name)?;
        let payload = serde_json::to_vec(config)
            .map_err(|e| Error::Protocol(format!("bad stream config: {e}")))?;
        self.ctx
            .api_request(&format!("STREAM.UPDATE.{}", config.name), payload)
    }

    pub fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        check_entity_name(stream)?;
        self.ctx
            .api_request(&format!("STREAM.INFO.{stream}"), Vec::new())
    }

    pub fn delete_stream(&self, stream: &str) -> Result<()> {
        check_entity_name(stream)?;
        let res: SuccessResponse = self
            .ctx
            .api_request(&format!("STREAM.DELETE.{stream}"), Vec::new())?;
        if !res.success {
            return Err(Error::Server("stream delete not acknowledged".to_string()));
        }
        Ok(())
    }

    pub fn purge_stream(&self, stream: &str) -> Result<()> {
        check_entity_name(stream)?;
        let res: SuccessResponse = self
            .ctx
            .api_request(&format!("STREAM.PURGE.{stream}"), Vec::new())?;
        if !res.success {
            return Err(Error::Server("stream purge not acknowledged".to_string()));
        }
        Ok(())
    }

    /// Resolves which stream serves `subject`.
    pub fn stream_name_by_subject(&self, subject: &str) -> Result<String> {
        let payload = serde_json::to_vec(&StreamNamesRequest { subject })
            .map_err(|e| Error::Protocol(format!("bad request: {e}")))?;
        let res: StreamNamesResponse = self.ctx.api_request("STREAM.NAMES", payload)?;
        res.streams
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or(Error::NotFound)
    }

    /// Creates a consumer. Durable consumers go through the durable
    /// creation subject, ephemerals through the plain one.
    pub fn add_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo> {
        check_entity_name(stream)?;
        let suffix = match &config.durable_name {
            Some(durable) => {
                check_entity_name(durable)?;
                format!("CONSUMER.DURABLE.CREATE.{stream}.{durable}")
            }
            None => format!("CONSUMER.CREATE.{stream}"),
        };
        let req = CreateConsumerRequest {
            stream_name: stream,
            config,
        };
        let payload = serde_json::to_vec(&req)
            .map_err(|e| Error::Protocol(format!("bad consumer config: {e}")))?;
        self.ctx.api_request(&suffix, payload)
    }

    pub fn consumer_info(&self, stream: &str, consumer: &str) -> Result<ConsumerInfo> {
        check_entity_name(stream)?;
        check_entity_name(consumer)?;
        self.ctx
            .api_request(&format!("CONSUMER.INFO.{stream}.{consumer}"), Vec::new())
    }

    pub fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<()> {
        check_entity_name(stream)?;
        check_entity_name(consumer)?;
        let res: SuccessResponse = self
            .ctx
            .api_request(&format!("CONSUMER.DELETE.{stream}.{consumer}"), Vec::new())?;
        if !res.success {
            return Err(Error::Server(
                "consumer delete not acknowledged".to_string(),
            ));
        }
        Ok(())
    }

    /// Deletes one message from a stream by sequence.
    pub fn delete_msg(&self, stream: &str, seq: u64) -> Result<()> {
        check_entity_name(stream)?;
        let payload = serde_json::to_vec(&MsgDeleteRequest { seq })
            .map_err(|e| Error::Protocol(format!("bad request: {e}")))?;
        let res: SuccessResponse = self
            .ctx
            .api_request(&format!("STREAM.MSG.DELETE.{stream}"), payload)?;
        if !res.success {
            return Err(Error::Server("message delete not acknowledged".to_string()));
        }
        Ok(())
    }

    /// Direct get: the response is a raw message (headers carry the
    /// stream metadata), not a JSON envelope.
    pub fn direct_get_msg(&self, stream: &str, request: &DirectGetRequest) -> Result<Message> {
        check_entity_name(stream)?;
        let conn = self.connection()?;
        let payload = serde_json::to_vec(request)
            .map_err(|e| Error::Protocol(format!("bad request: {e}")))?;
        let subject = format!("{}DIRECT.GET.{stream}", self.ctx.prefix);
        let msg = conn.request(&subject, payload, self.ctx.opts.request_timeout)?;
        if msg.status() == Some(STATUS_NO_MESSAGES) {
            return Err(Error::NotFound);
        }
        if let Some(code) = msg.status() {
            if code >= 400 {
                return Err(Error::Server(format!(
                    "direct get failed with status {code}"
                )));
            }
        }
        Ok(msg)
    }
}

/// Selector for `direct_get_msg`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DirectGetRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_by_subj: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_by_subj: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_names() {
        assert!(check_entity_name("ORDERS").is_ok());
        assert!(check_entity_name("orders-v2").is_ok());
        assert!(check_entity_name("").is_err());
        assert!(check_entity_name("a.b").is_err());
        assert!(check_entity_name("a b").is_err());
        assert!(check_entity_name("a*").is_err());
        assert!(check_entity_name("a>").is_err());
    }

    #[test]
    fn direct_get_request_shape() {
        let req = DirectGetRequest {
            last_by_subj: Some("orders.eu".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["last_by_subj"], "orders.eu");
        assert!(json.get("seq").is_none());
    }
}
