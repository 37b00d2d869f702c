//! Micro-service framework.
//!
//! A thin layer over queue subscriptions: each endpoint joins queue
//! group `"q"` so that one instance of the service handles each request,
//! while the monitoring verbs (PING, INFO, STATS) answer on broadcast
//! subjects at three scopes: all services, all instances of one service,
//! and one exact instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::headers::HeaderMap;
use crate::inbox;
use crate::message::Message;
use crate::subject;
use crate::subscription::Subscription;

const SRV_PREFIX: &str = "$SRV";
const ENDPOINT_QUEUE: &str = "q";
/// Stored error strings are clipped to keep STATS responses small.
const LAST_ERROR_MAX: usize = 256;

pub const HDR_SERVICE_ERROR: &str = "Nats-Service-Error";
pub const HDR_SERVICE_ERROR_CODE: &str = "Nats-Service-Error-Code";

/// Service identity.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        ServiceConfig {
            name: name.into(),
            version: version.into(),
            description: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Default)]
struct EndpointStats {
    num_requests: u64,
    num_errors: u64,
    processing_time: Duration,
    last_error: String,
}

struct Endpoint {
    name: String,
    subject: String,
    stats: Mutex<EndpointStats>,
}

struct SvcInner {
    conn: Connection,
    id: String,
    config: ServiceConfig,
    started_unix: u64,
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
    subs: Mutex<Vec<Subscription>>,
    stopped: AtomicBool,
}

/// A running service instance.
#[derive(Clone)]
pub struct Service {
    inner: Arc<SvcInner>,
}

/// One request dispatched to an endpoint handler.
pub struct Request {
    msg: Message,
    endpoint: Arc<Endpoint>,
}

impl Request {
    pub fn message(&self) -> &Message {
        &self.msg
    }

    pub fn subject(&self) -> &str {
        &self.msg.subject
    }

    pub fn payload(&self) -> &[u8] {
        &self.msg.payload
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.msg.headers.as_ref()
    }

    /// Replies with a success payload.
    pub fn respond(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.msg.respond(payload)
    }

    /// Replies with custom headers.
    pub fn respond_custom(&self, headers: &HeaderMap, payload: impl AsRef<[u8]>) -> Result<()> {
        let reply = self
            .msg
            .reply
            .as_deref()
            .ok_or(Error::InvalidArg("request has no reply subject"))?;
        let conn = self.msg.connection()?;
        conn.publish_with_headers(reply, headers, payload.as_ref())
    }

    /// Replies with the standard error headers and records the error in
    /// the endpoint stats.
    pub fn respond_error(
        &self,
        code: u16,
        description: &str,
        payload: impl AsRef<[u8]>,
    ) -> Result<()> {
        {
            let mut stats = self.endpoint.stats.lock().unwrap();
            stats.num_errors += 1;
            stats.last_error = format!("{code}:{description}");
            stats.last_error.truncate(LAST_ERROR_MAX);
        }
        let mut headers = HeaderMap::new();
        headers.insert(HDR_SERVICE_ERROR, description);
        headers.insert(HDR_SERVICE_ERROR_CODE, code.to_string());
        self.respond_custom(&headers, payload)
    }
}

#[derive(Serialize)]
struct PingResponse<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    name: &'a str,
    id: &'a str,
    version: &'a str,
}

#[derive(Serialize)]
struct EndpointInfo<'a> {
    name: &'a str,
    subject: &'a str,
    queue_group: &'a str,
}

#[derive(Serialize)]
struct InfoResponse<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    name: &'a str,
    id: &'a str,
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    endpoints: Vec<EndpointInfo<'a>>,
}

#[derive(Serialize)]
struct EndpointStatsJson<'a> {
    name: &'a str,
    subject: &'a str,
    num_requests: u64,
    num_errors: u64,
    /// Nanoseconds.
    processing_time: u128,
    average_processing_time: u128,
    #[serde(skip_serializing_if = "str::is_empty")]
    last_error: &'a str,
}

#[derive(Serialize)]
struct StatsResponse<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    name: &'a str,
    id: &'a str,
    version: &'a str,
    started: u64,
    endpoints: Vec<EndpointStatsJson<'a>>,
}

fn check_service_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(Error::InvalidArg("invalid service name"));
    }
    Ok(())
}

impl Service {
    /// Registers the monitoring subscriptions and returns the instance.
    pub fn add(conn: &Connection, config: ServiceConfig) -> Result<Service> {
        check_service_name(&config.name)?;
        if config.version.is_empty() {
            return Err(Error::InvalidArg("service version required"));
        }
        let id = inbox::next_nuid();
        let started_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let service = Service {
            inner: Arc::new(SvcInner {
                conn: conn.clone(),
                id,
                config,
                started_unix,
                endpoints: Mutex::new(Vec::new()),
                subs: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        };
        for verb in ["PING", "INFO", "STATS"] {
            service.subscribe_verb(verb)?;
        }
        Ok(service)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Registers a request endpoint under queue group `q`.
    pub fn add_endpoint<F>(
        &self,
        name: &str,
        endpoint_subject: &str,
        mut handler: F,
    ) -> Result<()>
    where
        F: FnMut(Request) + Send + 'static,
    {
        check_service_name(name)?;
        subject::check_subscribe_subject(endpoint_subject)?;
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(Error::IllegalState("service is stopped"));
        }
        let endpoint = Arc::new(Endpoint {
            name: name.to_string(),
            subject: endpoint_subject.to_string(),
            stats: Mutex::new(EndpointStats::default()),
        });
        let ep = Arc::clone(&endpoint);
        let sub = self.inner.conn.subscribe_handler_with(
            endpoint_subject,
            crate::options::SubscribeOptions::new().queue(ENDPOINT_QUEUE),
            move |msg| {
                let start = Instant::now();
                handler(Request {
                    msg,
                    endpoint: Arc::clone(&ep),
                });
                let elapsed = start.elapsed();
                let mut stats = ep.stats.lock().unwrap();
                stats.num_requests += 1;
                stats.processing_time += elapsed;
            },
        )?;
        self.inner.endpoints.lock().unwrap().push(endpoint);
        self.inner.subs.lock().unwrap().push(sub);
        Ok(())
    }

    /// Drains every subscription and stops answering.
    pub fn stop(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let subs = std::mem::take(&mut *self.inner.subs.lock().unwrap());
        for sub in subs {
            let _ = sub.drain();
        }
        Ok(())
    }

    /// Subscribes one verb at its three scopes.
    fn subscribe_verb(&self, verb: &str) -> Result<()> {
        let name = self.inner.config.name.clone();
        let id = self.inner.id.clone();
        let subjects = [
            format!("{SRV_PREFIX}.{verb}"),
            format!("{SRV_PREFIX}.{verb}.{name}"),
            format!("{SRV_PREFIX}.{verb}.{name}.{id}"),
        ];
        let mut subs = self.inner.subs.lock().unwrap();
        for subject in subjects {
            let service = self.clone();
            let verb = verb.to_string();
            let sub = self
                .inner
                .conn
                .subscribe_handler(&subject, move |msg| service.handle_verb(&verb, msg))?;
            subs.push(sub);
        }
        Ok(())
    }

    fn handle_verb(&self, verb: &str, msg: Message) {
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        let payload = match verb {
            "PING" => serde_json::to_vec(&PingResponse {
                kind: "io.nats.micro.v1.ping_response",
                name: &self.inner.config.name,
                id: &self.inner.id,
                version: &self.inner.config.version,
            }),
            "INFO" => {
                let endpoints = self.inner.endpoints.lock().unwrap();
                let infos: Vec<EndpointInfo> = endpoints
                    .iter()
                    .map(|ep| EndpointInfo {
                        name: &ep.name,
                        subject: &ep.subject,
                        queue_group: ENDPOINT_QUEUE,
                    })
                    .collect();
                serde_json::to_vec(&InfoResponse {
                    kind: "io.nats.micro.v1.info_response",
                    name: &self.inner.config.name,
                    id: &self.inner.id,
                    version: &self.inner.config.version,
                    description: self.inner.config.description.as_deref(),
                    endpoints: infos,
                })
            }
            "STATS" => {
                let endpoints = self.inner.endpoints.lock().unwrap();
                let guards: Vec<_> = endpoints
                    .iter()
                    .map(|ep| (ep, ep.stats.lock().unwrap()))
                    .collect();
                let stats: Vec<EndpointStatsJson> = guards
                    .iter()
                    .map(|(ep, stats)| {
                        let total = stats.processing_time.as_nanos();
                        let avg = if stats.num_requests > 0 {
                            total / stats.num_requests as u128
                        } else {
                            0
                        };
                        EndpointStatsJson {
                            name: &ep.name,
                            subject: &ep.subject,
                            num_requests: stats.num_requests,
                            num_errors: stats.num_errors,
                            processing_time: total,
                            average_processing_time: avg,
                            last_error: &stats.last_error,
                        }
                    })
                    .collect();
                serde_json::to_vec(&StatsResponse {
                    kind: "io.nats.micro.v1.stats_response",
                    name: &self.inner.config.name,
                    id: &self.inner.id,
                    version: &self.inner.config.version,
                    started: self.inner.started_unix,
                    endpoints: stats,
                })
            }
            _ => return,
        };
        if let Ok(payload) = payload {
            let _ = msg.respond(payload);
        }
    }
}
