//! Outbound side of the protocol: channels that carry wire documents and the
//! per-agent client that stamps, sends and retries envelopes.

use crate::{
    acl::{self, Content, Decoded, Envelope, Performative},
    error::{AgentError, Result},
    model::AgentIdentity,
    server::{serve_document, MessageHandler},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

/// Delivers one wire document to an agent address and returns its reply.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn deliver(&self, address: &str, document: Value) -> Result<Value>;
}

#[derive(Clone)]
pub struct HttpChannel {
    http: reqwest::Client,
}

impl HttpChannel {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl MessageChannel for HttpChannel {
    async fn deliver(&self, address: &str, document: Value) -> Result<Value> {
        let response = self
            .http
            .post(address)
            .json(&document)
            .send()
            .await
            .map_err(|e| AgentError::unreachable(address, e))?;

        if !response.status().is_success() {
            return Err(AgentError::Protocol(format!(
                "{} answered with HTTP {}",
                address,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::unreachable(address, e))?;
        // Non-JSON replies surface as unparseable envelopes upstream.
        Ok(serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }
}

/// In-process channel routing documents straight to mounted handlers.
#[derive(Clone, Default)]
pub struct LocalChannel {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn MessageHandler>>>>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts `handler` at its own comm address.
    pub fn mount(&self, handler: Arc<dyn MessageHandler>) {
        let address = handler.identity().comm_address.clone();
        self.mount_at(address, handler);
    }

    pub fn mount_at(&self, address: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().insert(address.into(), handler);
    }

    pub fn unmount(&self, address: &str) -> bool {
        self.handlers.write().remove(address).is_some()
    }
}

#[async_trait]
impl MessageChannel for LocalChannel {
    async fn deliver(&self, address: &str, document: Value) -> Result<Value> {
        let handler = self
            .handlers
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| AgentError::unreachable(address, "no agent mounted at this address"))?;
        Ok(serve_document(handler.as_ref(), document).await)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }
}

/// Per-agent messaging handle. Every envelope an agent emits, request or
/// reply, is stamped here so conversation numbers stay monotonic.
pub struct AgentClient {
    identity: AgentIdentity,
    seq: AtomicU64,
    channel: Arc<dyn MessageChannel>,
    retry: RetryPolicy,
}

impl AgentClient {
    pub fn new(identity: AgentIdentity, channel: Arc<dyn MessageChannel>) -> Self {
        Self {
            identity,
            seq: AtomicU64::new(0),
            channel,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn message(&self, performative: Performative, receiver: Option<&str>, content: Option<Content>) -> Envelope {
        let seq = self.next_seq();
        let mut envelope = Envelope::new(performative, self.identity.uri.clone(), seq);
        if let Some(receiver) = receiver {
            envelope = envelope.to(receiver);
        }
        if let Some(content) = content {
            let reference = format!("{}-{}-{}", self.identity.name, content.action(), seq);
            envelope = envelope.with_content(reference, content);
        }
        envelope
    }

    pub fn reply_to(&self, request: &Envelope, performative: Performative, content: Option<Content>) -> Envelope {
        self.message(performative, Some(request.sender.as_str()), content)
    }

    /// Sends `envelope` to `address` and waits for the reply. Only
    /// unreachable peers are retried.
    pub async fn request(&self, address: &str, envelope: &Envelope) -> Result<Envelope> {
        let document = acl::encode(envelope)?;
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1;

        loop {
            debug!(
                "{} -> {}: {} #{}",
                self.identity.name, address, envelope.performative, envelope.conversation_seq
            );
            match self.channel.deliver(address, document.clone()).await {
                Ok(reply) => {
                    return match acl::decode(&reply)? {
                        Decoded::Message(reply) => Ok(reply),
                        Decoded::Unparseable => Err(AgentError::Protocol(format!(
                            "{} returned an unparseable reply",
                            address
                        ))),
                    }
                }
                Err(e) if e.is_unreachable() && attempt < self.retry.max_attempts => {
                    warn!(
                        "Attempt {}/{} to reach {} failed: {}; retrying in {:?}",
                        attempt, self.retry.max_attempts, address, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
