// src/queue/mod.rs
//! Broker boundary: wire envelope, client traits, STOMP transport,
//! publisher and the long-running listener.

pub mod listener;
pub mod memory;
pub mod publisher;
pub mod stomp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ConsumerDecodeError, QueueError};
use crate::ingest::types::Job;

pub const SCHEMA_VERSION: u32 = 1;
pub const JOB_KIND: &str = "job_listing";
pub const CYCLE_FAILURE_KIND: &str = "cycle_failure";

/// Versioned message body carrying one canonical job record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEnvelope {
    pub schema_version: u32,
    pub kind: String,
    pub published_at: DateTime<Utc>,
    pub job: Job,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    schema_version: u32,
    #[serde(default)]
    kind: Option<String>,
}

impl JobEnvelope {
    pub fn new(job: Job, published_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            kind: JOB_KIND.to_string(),
            published_at,
            job,
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Version and kind are checked before the body is decoded, so a future
    /// schema yields `UnsupportedVersion` rather than a field error.
    pub fn decode(body: &[u8]) -> Result<Self, ConsumerDecodeError> {
        let text = String::from_utf8(body.to_vec())?;
        let header: EnvelopeHeader = serde_json::from_str(&text)?;
        if header.schema_version != SCHEMA_VERSION {
            return Err(ConsumerDecodeError::UnsupportedVersion {
                found: header.schema_version,
                expected: SCHEMA_VERSION,
            });
        }
        if let Some(kind) = header.kind.filter(|k| k != JOB_KIND) {
            return Err(ConsumerDecodeError::UnsupportedKind(kind));
        }
        let env: JobEnvelope = serde_json::from_str(&text)?;
        if env.job.fingerprint.trim().is_empty() {
            return Err(ConsumerDecodeError::MissingFingerprint);
        }
        Ok(env)
    }
}

/// Tells consumers on the job destination that a collection cycle failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleFailure {
    pub started_at: DateTime<Utc>,
    pub reason: String,
    /// `(source name, error)` for every source that failed.
    pub sources: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleFailureEnvelope {
    pub schema_version: u32,
    pub kind: String,
    pub published_at: DateTime<Utc>,
    pub failure: CycleFailure,
}

impl CycleFailureEnvelope {
    pub fn new(failure: CycleFailure, published_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            kind: CYCLE_FAILURE_KIND.to_string(),
            published_at,
            failure,
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, ConsumerDecodeError> {
        let env: CycleFailureEnvelope = serde_json::from_slice(body)?;
        if env.schema_version != SCHEMA_VERSION {
            return Err(ConsumerDecodeError::UnsupportedVersion {
                found: env.schema_version,
                expected: SCHEMA_VERSION,
            });
        }
        if env.kind != CYCLE_FAILURE_KIND {
            return Err(ConsumerDecodeError::UnsupportedKind(env.kind));
        }
        Ok(env)
    }
}

/// A message addressed to one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub destination: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl QueueMessage {
    pub fn for_job(destination: &str, envelope: &JobEnvelope) -> serde_json::Result<Self> {
        Ok(Self {
            destination: destination.to_string(),
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("fingerprint".into(), envelope.job.fingerprint.clone()),
                ("schema-version".into(), envelope.schema_version.to_string()),
                ("persistent".into(), "true".into()),
            ],
            body: envelope.encode()?,
        })
    }

    pub fn for_cycle_failure(
        destination: &str,
        envelope: &CycleFailureEnvelope,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            destination: destination.to_string(),
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("kind".into(), envelope.kind.clone()),
                ("schema-version".into(), envelope.schema_version.to_string()),
                ("persistent".into(), "true".into()),
            ],
            body: serde_json::to_string(envelope)?,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// One message handed to a consumer, pending ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub ack_id: String,
    pub message_id: Option<String>,
    pub destination: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Producer side of a broker connection.
#[async_trait]
pub trait QueueClient: Send {
    /// Resolves once the broker acknowledged the message.
    async fn send(&mut self, message: &QueueMessage) -> Result<(), QueueError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn QueueClient>, QueueError>;
}

/// Consumer side of a broker connection bound to one destination.
#[async_trait]
pub trait QueueSubscription: Send {
    /// Suspends until the next delivery. `Ok(None)` means the connection ended.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError>;
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError>;
    async fn nack(&mut self, delivery: &Delivery) -> Result<(), QueueError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait QueueSubscriber: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn QueueSubscription>, QueueError>;
}

/// Connector used when the broker is disabled in configuration.
pub struct DisabledConnector;

#[async_trait]
impl QueueConnector for DisabledConnector {
    async fn connect(&self) -> Result<Box<dyn QueueClient>, QueueError> {
        Err(QueueError::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::SourceKind;

    fn job() -> Job {
        Job {
            source: SourceKind::Feed,
            fingerprint: "abc".into(),
            title: "Rust Engineer".into(),
            company: Some("Acme".into()),
            location: None,
            posted_at: None,
            salary_min: None,
            salary_max: None,
            url: Some("https://acme.test/jobs/1".into()),
            site: None,
            is_remote: Some(true),
            description: None,
            salary_interval: None,
            currency: None,
            emails: vec![],
            tags: vec![],
            search_keyword: None,
            raw_payload: serde_json::json!({"k": "v"}),
        }
    }

    #[test]
    fn message_headers_carry_fingerprint_and_version() {
        let env = JobEnvelope::new(job(), Utc::now());
        let msg = QueueMessage::for_job("/queue/etl_job_leads", &env).unwrap();
        assert_eq!(msg.header("fingerprint"), Some("abc"));
        assert_eq!(msg.header("schema-version"), Some("1"));
        let back = JobEnvelope::decode(msg.body.as_bytes()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn decode_rejects_future_versions_and_garbage() {
        let body = br#"{"schema_version": 2, "kind": "job_listing", "job": {}}"#;
        assert!(matches!(
            JobEnvelope::decode(body),
            Err(ConsumerDecodeError::UnsupportedVersion { found: 2, .. })
        ));
        assert!(matches!(
            JobEnvelope::decode(b"not json"),
            Err(ConsumerDecodeError::Json(_))
        ));
        assert!(matches!(
            JobEnvelope::decode(&[0xff, 0xfe]),
            Err(ConsumerDecodeError::InvalidUtf8(_))
        ));
    }
}
