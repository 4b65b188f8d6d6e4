// src/errors.rs
//! Error taxonomy shared by the collection pipeline and the queue consumer.
//!
//! Every variant here is recoverable: the component that observes it turns it
//! into a skip or retry decision and logs it. Nothing is fatal to the process.

use thiserror::Error;

use crate::ingest::types::SourceKind;

/// Connector-local failure. The cycle skips that source.
#[derive(Debug, Error)]
pub enum SourceFetchError {
    #[error("{source_name}: http request to {url} failed: {error}")]
    Http {
        source_name: &'static str,
        url: String,
        #[source]
        error: reqwest::Error,
    },
    #[error("{source_name}: rate limited by {url}")]
    RateLimited {
        source_name: &'static str,
        url: String,
    },
    #[error("{source_name}: unexpected status {status} from {url}")]
    Status {
        source_name: &'static str,
        url: String,
        status: u16,
    },
    #[error("{source_name}: could not parse response: {reason}")]
    Parse {
        source_name: &'static str,
        reason: String,
    },
    #[error("{source_name}: browser session error: {reason}")]
    Browser {
        source_name: &'static str,
        reason: String,
    },
    #[error("{source_name}: timed out after {secs}s")]
    Timeout { source_name: &'static str, secs: u64 },
    #[error("{source_name}: cancelled")]
    Cancelled { source_name: &'static str },
    #[error("{source_name}: all {attempted} queries failed")]
    AllQueriesFailed {
        source_name: &'static str,
        attempted: usize,
    },
}

/// Normalizer-local failure. The single record is dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed {source_kind} record: {reason}")]
pub struct MalformedRecord {
    pub source_kind: SourceKind,
    pub reason: String,
}

impl MalformedRecord {
    pub fn new(source_kind: SourceKind, reason: impl Into<String>) -> Self {
        Self {
            source_kind,
            reason: reason.into(),
        }
    }
}

/// Transport or protocol failure talking to the broker.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stomp protocol error: {0}")]
    Protocol(String),
    #[error("broker returned ERROR frame: {message}")]
    Broker { message: String, details: String },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("broker connection closed")]
    Closed,
    #[error("broker disabled in configuration")]
    Disabled,
}

/// Publisher-side outcome for a single record.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The broker was reachable but this record was not acknowledged.
    /// The record stays unmarked and is retried next cycle.
    #[error("delivery of {fingerprint} failed: {error}")]
    Delivery {
        fingerprint: String,
        #[source]
        error: QueueError,
    },
    /// No connection could be established for the rest of the cycle.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(#[source] QueueError),
    #[error("could not encode {fingerprint}: {error}")]
    Encode {
        fingerprint: String,
        #[source]
        error: serde_json::Error,
    },
}

/// Listener-local failure to decode a delivered message. The message is skipped.
#[derive(Debug, Error)]
pub enum ConsumerDecodeError {
    #[error("message body is not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("message body is not a job envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported schema_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("unsupported message kind {0:?}")]
    UnsupportedKind(String),
    #[error("envelope carries an empty fingerprint")]
    MissingFingerprint,
}
