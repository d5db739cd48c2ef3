//! Producer-facing dispatch API.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use symphony_core::{
    AdminStore, Envelope, EnvelopeId, Message, Priority, RetryStrategy, SymphonyEvent, Transport,
    TransportError, ValidationError,
};
use thiserror::Error;

use crate::config::RoutingRule;
use crate::observability::Observability;

/// Dispatch errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Named transports, each with its admin surface.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: BTreeMap<String, (Arc<dyn Transport>, Arc<dyn AdminStore>)>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport under its own name.
    pub fn register<T: Transport + AdminStore>(&mut self, transport: T) {
        let transport = Arc::new(transport);
        let name = transport.name().to_string();
        let admin: Arc<dyn AdminStore> = transport.clone();
        self.transports.insert(name, (transport, admin));
    }

    pub fn with<T: Transport + AdminStore>(mut self, transport: T) -> Self {
        self.register(transport);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(name).map(|(transport, _)| transport.clone())
    }

    pub fn admin(&self, name: &str) -> Option<Arc<dyn AdminStore>> {
        self.transports.get(name).map(|(_, admin)| admin.clone())
    }

    pub fn names(&self) -> Vec<&str> {
        self.transports.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Transport>, &Arc<dyn AdminStore>)> {
        self.transports
            .iter()
            .map(|(name, (transport, admin))| (name.as_str(), transport, admin))
    }
}

/// Per-dispatch options. Unset fields fall back to routing rules, then defaults.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub transport: Option<String>,
    pub queue: Option<String>,
    pub priority: Option<Priority>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    /// Merged into the message metadata.
    pub metadata: BTreeMap<String, Value>,
    pub headers: BTreeMap<String, String>,
}

impl DispatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Confirmation of a durable dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub message_id: EnvelopeId,
    pub transport_name: String,
    pub queue_name: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// The idempotency key was held by a live envelope; `message_id` is that envelope.
    pub duplicate: bool,
}

/// Wraps messages in envelopes and stores them on the resolved transport.
#[derive(Clone)]
pub struct Dispatcher {
    transports: TransportRegistry,
    routing: Arc<Vec<RoutingRule>>,
    default_transport: String,
    default_queue: String,
    retry: Arc<dyn RetryStrategy>,
    observability: Observability,
}

impl Dispatcher {
    pub fn new(
        transports: TransportRegistry,
        retry: Arc<dyn RetryStrategy>,
        observability: Observability,
    ) -> Self {
        Self {
            transports,
            routing: Arc::new(Vec::new()),
            default_transport: "default".to_string(),
            default_queue: "default".to_string(),
            retry,
            observability,
        }
    }

    pub fn with_routing(mut self, routing: Vec<RoutingRule>) -> Self {
        self.routing = Arc::new(routing);
        self
    }

    pub fn with_defaults(
        mut self,
        transport: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        self.default_transport = transport.into();
        self.default_queue = queue.into();
        self
    }

    fn route(&self, message_type: &str) -> Option<&RoutingRule> {
        self.routing.iter().find(|rule| rule.matches(message_type))
    }

    /// Build the envelope `dispatch` would store, without storing it.
    pub fn build_envelope(
        &self,
        mut message: Message,
        options: DispatchOptions,
    ) -> Result<(Arc<dyn Transport>, Envelope), DispatchError> {
        message.validate()?;
        message.metadata.extend(options.metadata);

        let rule = self.route(&message.message_type);
        let transport_name = options
            .transport
            .or_else(|| rule.and_then(|r| r.transport.clone()))
            .unwrap_or_else(|| self.default_transport.clone());
        let queue_name = options
            .queue
            .or_else(|| rule.and_then(|r| r.queue.clone()))
            .unwrap_or_else(|| self.default_queue.clone());
        let priority = match options.priority {
            Some(priority) => priority,
            None => rule
                .and_then(|r| r.priority)
                .map(Priority::new)
                .transpose()?
                .unwrap_or_default(),
        };

        let transport = self
            .transports
            .get(&transport_name)
            .ok_or_else(|| DispatchError::UnknownTransport(transport_name.clone()))?;

        let max_retries = self.retry.get_max_retries(&message.message_type);
        let mut envelope = Envelope::new(message, transport_name, queue_name)
            .with_priority(priority)
            .with_max_retries(max_retries);
        if let Some(at) = options.scheduled_at {
            envelope = envelope.with_scheduled_at(at);
        }
        if let Some(key) = options.idempotency_key {
            envelope = envelope.with_idempotency_key(key);
        }
        envelope.headers.extend(options.headers);

        Ok((transport, envelope))
    }

    /// Store one envelope for `message`.
    ///
    /// Either the envelope is durably stored (or an existing one with the same
    /// idempotency key is returned) or an error is raised.
    pub async fn dispatch(
        &self,
        message: Message,
        options: DispatchOptions,
    ) -> Result<DispatchReceipt, DispatchError> {
        let (transport, envelope) = self.build_envelope(message, options)?;
        let message_type = envelope.message_type().to_string();
        let transport_name = envelope.transport_name.clone();
        let queue_name = envelope.queue_name.clone();
        let scheduled_at = envelope.scheduled_at;

        let outcome = transport.send(envelope).await?;
        let receipt = DispatchReceipt {
            message_id: outcome.id(),
            transport_name,
            queue_name,
            scheduled_at,
            duplicate: outcome.is_duplicate(),
        };

        if receipt.duplicate {
            tracing::debug!(
                message_id = %receipt.message_id,
                message_type = %message_type,
                "Duplicate dispatch absorbed by idempotency key"
            );
        } else {
            tracing::debug!(
                message_id = %receipt.message_id,
                message_type = %message_type,
                transport = %receipt.transport_name,
                queue = %receipt.queue_name,
                "Message dispatched"
            );
        }
        self.observability.publish(SymphonyEvent::MessageDispatched {
            message_id: receipt.message_id,
            message_type,
            transport: receipt.transport_name.clone(),
            queue: receipt.queue_name.clone(),
            duplicate: receipt.duplicate,
            timestamp: Utc::now(),
        });

        Ok(receipt)
    }
}
