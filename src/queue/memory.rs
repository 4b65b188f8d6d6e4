// src/queue/memory.rs
//! In-process broker. Test helper, also handy for dry runs.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::errors::QueueError;
use crate::queue::{
    Delivery, QueueClient, QueueConnector, QueueMessage, QueueSubscriber, QueueSubscription,
};

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    failing: HashSet<String>,
    published: Vec<QueueMessage>,
    pending: VecDeque<Delivery>,
    acked: Vec<String>,
    nacked: Vec<String>,
    connects: usize,
    next_id: u64,
}

#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                failing: HashSet::new(),
                published: Vec::new(),
                pending: VecDeque::new(),
                acked: Vec::new(),
                nacked: Vec::new(),
                connects: 0,
                next_id: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Reject every SEND carrying this fingerprint header.
    pub fn fail_fingerprint(&self, fingerprint: &str) {
        self.state().failing.insert(fingerprint.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn published(&self) -> Vec<QueueMessage> {
        self.state().published.clone()
    }

    pub fn published_fingerprints(&self) -> Vec<String> {
        self.state()
            .published
            .iter()
            .filter_map(|m| m.header("fingerprint").map(str::to_string))
            .collect()
    }

    /// Queue a raw body for subscribers.
    pub fn inject(&self, body: impl Into<Vec<u8>>) {
        let mut st = self.state();
        st.next_id += 1;
        let id = format!("mem-{}", st.next_id);
        st.pending.push_back(Delivery {
            ack_id: id.clone(),
            message_id: Some(id),
            destination: "memory".into(),
            headers: Vec::new(),
            body: body.into(),
        });
    }

    /// Hand everything published so far to subscribers, as a real queue would.
    pub fn deliver_published(&self) {
        let bodies: Vec<String> = self.state().published.iter().map(|m| m.body.clone()).collect();
        for body in bodies {
            self.inject(body);
        }
    }

    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    pub fn acked(&self) -> Vec<String> {
        self.state().acked.clone()
    }

    pub fn nacked(&self) -> Vec<String> {
        self.state().nacked.clone()
    }
}

pub struct MemoryClient {
    broker: MemoryBroker,
}

#[async_trait]
impl QueueClient for MemoryClient {
    async fn send(&mut self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut st = self.broker.state();
        if !st.reachable {
            return Err(QueueError::Closed);
        }
        if let Some(fp) = message.header("fingerprint") {
            if st.failing.contains(fp) {
                return Err(QueueError::Broker {
                    message: "rejected".into(),
                    details: fp.to_string(),
                });
            }
        }
        st.published.push(message.clone());
        Ok(())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl QueueConnector for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn QueueClient>, QueueError> {
        let mut st = self.state();
        if !st.reachable {
            return Err(QueueError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory broker unreachable",
            )));
        }
        st.connects += 1;
        Ok(Box::new(MemoryClient {
            broker: self.clone(),
        }))
    }
}

/// Yields pending deliveries and ends once the queue is drained.
pub struct MemorySubscription {
    broker: MemoryBroker,
}

#[async_trait]
impl QueueSubscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        Ok(self.broker.state().pending.pop_front())
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        self.broker.state().acked.push(delivery.ack_id.clone());
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        self.broker.state().nacked.push(delivery.ack_id.clone());
        Ok(())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl QueueSubscriber for MemoryBroker {
    async fn subscribe(&self) -> Result<Box<dyn QueueSubscription>, QueueError> {
        let mut st = self.state();
        if !st.reachable {
            return Err(QueueError::Closed);
        }
        st.connects += 1;
        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
        }))
    }
}
