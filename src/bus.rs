//! Subject-addressed publish/subscribe bus
//!
//! The five components talk to each other exclusively through this bus.
//! Subjects are plain strings (`probes.check.result`,
//! `probes.check.assign.<worker_id>`, ...); each subject is backed by a
//! bounded broadcast channel.
//!
//! ## Delivery semantics
//!
//! - Publishing never blocks. A subject with no subscribers drops the
//!   message silently.
//! - A slow subscriber lags and loses the oldest messages
//!   (`RecvError::Lagged`); the subscription logs the gap and keeps going.
//!   Consumers are expected to be robust to drops.
//! - Subscribers only see messages published after they subscribed.
//!
//! Payloads are serialized to JSON at publish time, so every subscriber
//! decodes independently and a malformed message can never poison another
//! consumer: schema errors are logged and dropped inside [`Subscription`].

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::warn;

/// Default per-subject buffer. Sized so short consumer stalls do not drop
/// messages while keeping worst-case memory bounded.
pub const DEFAULT_CAPACITY: usize = 256;

pub struct Bus {
    capacity: usize,
    subjects: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subjects: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, subject: &str) -> broadcast::Sender<String> {
        let mut subjects = self.subjects.lock().expect("bus registry poisoned");
        subjects
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish a payload on a subject. Fire-and-forget: the send "fails"
    /// only when nobody is subscribed, which is not an error for a bus.
    pub fn publish<T: Serialize>(&self, subject: &str, payload: &T) -> anyhow::Result<()> {
        let raw = serde_json::to_string(payload)?;
        let _ = self.sender(subject).send(raw);
        Ok(())
    }

    pub fn subscribe(&self, subject: &str) -> Subscription {
        Subscription {
            subject: subject.to_string(),
            rx: self.sender(subject).subscribe(),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A typed view onto one subject's message stream.
pub struct Subscription {
    subject: String,
    rx: broadcast::Receiver<String>,
}

impl Subscription {
    /// Receive the next decodable message.
    ///
    /// Lagged gaps and schema errors are logged and skipped; `None` means
    /// the bus side has been dropped and no more messages will arrive.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(raw) => match serde_json::from_str(&raw) {
                    Ok(payload) => return Some(payload),
                    Err(e) => {
                        warn!(subject = %self.subject, "dropping undecodable message: {e}");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(subject = %self.subject, skipped, "subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
