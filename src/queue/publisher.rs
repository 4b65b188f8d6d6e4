// src/queue/publisher.rs
//! Per-cycle publisher: one lazy broker connection, one reconnect attempt on
//! a broken session, and a sticky "unavailable" flag once connecting fails.

use std::sync::Arc;

use chrono::Utc;

use crate::errors::{PublishError, QueueError};
use crate::ingest::types::Job;
use crate::queue::{
    CycleFailure, CycleFailureEnvelope, JobEnvelope, QueueClient, QueueConnector, QueueMessage,
    CYCLE_FAILURE_KIND,
};

pub struct Publisher {
    connector: Arc<dyn QueueConnector>,
    client: Option<Box<dyn QueueClient>>,
    destination: String,
    unavailable: bool,
}

impl Publisher {
    pub fn new(connector: Arc<dyn QueueConnector>, destination: impl Into<String>) -> Self {
        Self {
            connector,
            client: None,
            destination: destination.into(),
            unavailable: false,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable
    }

    /// Reset per-cycle state. A broker that was down last cycle gets another try.
    pub fn begin_cycle(&mut self) {
        self.unavailable = false;
    }

    /// Publish one record. `Ok` means the broker acknowledged it.
    pub async fn publish(&mut self, job: &Job) -> Result<(), PublishError> {
        let envelope = JobEnvelope::new(job.clone(), Utc::now());
        let message = QueueMessage::for_job(&self.destination, &envelope).map_err(|error| {
            PublishError::Encode {
                fingerprint: job.fingerprint.clone(),
                error,
            }
        })?;
        self.deliver(&message, &job.fingerprint).await
    }

    /// Tell consumers of the destination that this cycle failed.
    pub async fn publish_cycle_failure(&mut self, failure: &CycleFailure) -> Result<(), PublishError> {
        let envelope = CycleFailureEnvelope::new(failure.clone(), Utc::now());
        let message = QueueMessage::for_cycle_failure(&self.destination, &envelope).map_err(
            |error| PublishError::Encode {
                fingerprint: CYCLE_FAILURE_KIND.to_string(),
                error,
            },
        )?;
        self.deliver(&message, CYCLE_FAILURE_KIND).await
    }

    /// Send on the cycle's connection, reconnecting once on failure. `key`
    /// identifies the message in logs and errors.
    async fn deliver(&mut self, message: &QueueMessage, key: &str) -> Result<(), PublishError> {
        let first = match self.client.as_mut() {
            Some(client) => client.send(message).await,
            None => {
                let mut client = self.open().await?;
                let res = client.send(message).await;
                self.client = Some(client);
                res
            }
        };
        let error = match first {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        tracing::warn!(
            target: "queue",
            fingerprint = %key,
            error = %error,
            "send failed, reconnecting once"
        );
        self.client = None;
        let mut client = self.open().await?;
        match client.send(message).await {
            Ok(()) => {
                self.client = Some(client);
                Ok(())
            }
            Err(error) => {
                client.close().await;
                Err(PublishError::Delivery {
                    fingerprint: key.to_string(),
                    error,
                })
            }
        }
    }

    /// Close the cycle's connection, if any.
    pub async fn end_cycle(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.close().await;
        }
    }

    async fn open(&mut self) -> Result<Box<dyn QueueClient>, PublishError> {
        if self.unavailable {
            return Err(PublishError::BrokerUnavailable(QueueError::Closed));
        }
        match self.connector.connect().await {
            Ok(client) => Ok(client),
            Err(e) => {
                self.unavailable = true;
                tracing::error!(target: "queue", error = %e, "broker unavailable");
                Err(PublishError::BrokerUnavailable(e))
            }
        }
    }
}
