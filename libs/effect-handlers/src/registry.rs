use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use message_model::EffectError;

/// Why dispatch failed, distinguishing a decode failure (the engine's
/// `bad_json` case) from a handler-classified effect error (the engine's
/// ordinary retry/DLQ policy).
#[derive(Debug)]
pub enum DispatchError {
    BadJson(String),
    Handler(EffectError),
}

impl From<EffectError> for DispatchError {
    fn from(e: EffectError) -> Self {
        DispatchError::Handler(e)
    }
}

/// One routing key's worth of behavior. Implementations own their own
/// payload deserialization so a decode failure can be reported distinctly
/// from a classified effect error.
#[async_trait]
pub trait EffectHandler: Send + Sync {
    async fn dispatch(&self, body: &[u8]) -> Result<(), DispatchError>;
}

/// The closed sum over routing keys the delivery engine dispatches through.
/// Unknown keys are a first-class state (the engine logs and drops), not a
/// programming error -- so the registry exposes `get` returning `Option`
/// rather than panicking on a miss.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EffectHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, routing_key: impl Into<String>, handler: Arc<dyn EffectHandler>) -> Self {
        self.handlers.insert(routing_key.into(), handler);
        self
    }

    pub fn get(&self, routing_key: &str) -> Option<Arc<dyn EffectHandler>> {
        self.handlers.get(routing_key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysOk;

    #[async_trait]
    impl EffectHandler for AlwaysOk {
        async fn dispatch(&self, _body: &[u8]) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unknown_routing_key_returns_none() {
        let registry = HandlerRegistry::new().register("auth.email.verify.requested", Arc::new(AlwaysOk));
        assert!(registry.get("totally.unknown").is_none());
        assert!(registry.get("auth.email.verify.requested").is_some());
    }
}
