//! Message handler trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use symphony_core::{Envelope, ErrorKind, HandlerError, Message};

/// Future type for async message handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// What a handler knows about the delivery it is processing.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub envelope: Envelope,
    pub retry_count: u32,
    pub max_retries: u32,
    pub worker_id: String,
    /// Set when the previous attempt failed authentication; refresh credentials first.
    pub auth_refresh: bool,
}

impl HandlerContext {
    pub fn new(envelope: Envelope, worker_id: impl Into<String>) -> Self {
        Self {
            retry_count: envelope.retry_count,
            max_retries: envelope.max_retries,
            auth_refresh: envelope.auth_refresh_requested(),
            worker_id: worker_id.into(),
            envelope,
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Trait for message handlers.
///
/// Implement this trait to define how messages of one type are processed.
pub trait MessageHandler: Send + Sync + 'static {
    /// The message type this handler processes.
    fn message_type(&self) -> &str;

    /// Process a message.
    fn handle(&self, message: Message, context: HandlerContext) -> HandlerFuture;

    /// Classification of a failure, consumed by the retry strategy.
    fn classify(&self, error: &HandlerError) -> ErrorKind {
        error.kind
    }

    /// Circuit breaker key for the downstream this message is sent through.
    ///
    /// Defaults to the `destination` metadata entry, then the message type.
    fn destination(&self, message: &Message) -> String {
        message
            .metadata
            .get("destination")
            .and_then(|value| value.as_str())
            .map_or_else(|| message.message_type.clone(), str::to_string)
    }

    /// Per-handler timeout, overriding the worker's.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Registry for message handlers.
///
/// Maps message types to their handlers for dynamic dispatch.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any earlier one for the same type.
    pub fn register<H: MessageHandler>(&mut self, handler: H) {
        let message_type = handler.message_type().to_string();
        self.handlers.insert(message_type, Arc::new(handler));
    }

    pub fn with<H: MessageHandler>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(message_type).cloned()
    }

    pub fn has_handler(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Registered message types, sorted.
    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

type Classifier = Box<dyn Fn(&HandlerError) -> ErrorKind + Send + Sync>;

/// A function-based message handler.
pub struct FnHandler<F>
where
    F: Fn(Message, HandlerContext) -> HandlerFuture + Send + Sync + 'static,
{
    message_type: String,
    handler: F,
    classifier: Option<Classifier>,
    timeout: Option<Duration>,
}

impl<F> FnHandler<F>
where
    F: Fn(Message, HandlerContext) -> HandlerFuture + Send + Sync + 'static,
{
    pub fn new(message_type: impl Into<String>, handler: F) -> Self {
        Self {
            message_type: message_type.into(),
            handler,
            classifier: None,
            timeout: None,
        }
    }

    /// Override how failures of this handler are classified.
    pub fn with_classifier(
        mut self,
        classifier: impl Fn(&HandlerError) -> ErrorKind + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Some(Box::new(classifier));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Message, HandlerContext) -> HandlerFuture + Send + Sync + 'static,
{
    fn message_type(&self) -> &str {
        &self.message_type
    }

    fn handle(&self, message: Message, context: HandlerContext) -> HandlerFuture {
        (self.handler)(message, context)
    }

    fn classify(&self, error: &HandlerError) -> ErrorKind {
        self.classifier
            .as_ref()
            .map_or(error.kind, |classify| classify(error))
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Helper macro for creating message handlers from async blocks.
#[macro_export]
macro_rules! message_handler {
    ($message_type:expr, |$message:ident, $context:ident| $body:expr) => {
        $crate::FnHandler::new(
            $message_type,
            |$message: ::symphony_core::Message, $context: $crate::HandlerContext| {
                Box::pin(async move {
                    let result: Result<(), ::symphony_core::HandlerError> = $body;
                    result
                }) as $crate::HandlerFuture
            },
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_replaces_by_type() {
        let mut registry = HandlerRegistry::new();
        registry.register(message_handler!("email.send", |_m, _c| Ok(())));
        registry.register(message_handler!("calendar.sync", |_m, _c| Ok(())));
        registry.register(message_handler!("email.send", |_m, _c| Err(
            HandlerError::permanent("replaced")
        )));

        assert_eq!(registry.message_types(), vec!["calendar.sync", "email.send"]);
        assert!(registry.has_handler("email.send"));
        assert!(registry.get("sms.send").is_none());
    }

    #[test]
    fn classifier_overrides_error_kind() {
        let handler = message_handler!("calendar.sync", |_m, _c| Ok(())).with_classifier(|err| {
            if err.message.contains("invalid_grant") {
                ErrorKind::Permanent
            } else {
                err.kind
            }
        });

        let revoked = HandlerError::authentication("invalid_grant: token revoked");
        assert_eq!(handler.classify(&revoked), ErrorKind::Permanent);
        let expired = HandlerError::authentication("token expired");
        assert_eq!(handler.classify(&expired), ErrorKind::Authentication);
    }

    #[test]
    fn destination_prefers_metadata() {
        let handler = message_handler!("email.send", |_m, _c| Ok(()));
        let plain = Message::new("email.send", json!({})).unwrap();
        assert_eq!(handler.destination(&plain), "email.send");
        let routed = plain.with_metadata("destination", "mailbox-7");
        assert_eq!(handler.destination(&routed), "mailbox-7");
    }
}
