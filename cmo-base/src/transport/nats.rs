use std::time::Duration;

use async_trait::async_trait;

use cmo_core::traits::{
    ComponentHealth, Delivery, SubscribeOptions, Subscription, Transport, TransportStats,
};
use cmo_core::{Envelope, Topic, TransportError};

/// NOT-IMPLEMENTED NATS variant.
///
/// Kept as a compile-time variant so that selecting it is an explicit,
/// well-typed error rather than a missing symbol. The contract matches the
/// Redis variant exactly; every call answers `not_implemented`.
#[derive(Debug, Default, Clone)]
pub struct NatsTransport;

impl NatsTransport {
    /// The stub instance.
    pub fn new() -> Self {
        Self
    }

    fn unimplemented<T>() -> Result<T, TransportError> {
        Err(TransportError::NotImplemented("nats"))
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Self::unimplemented()
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Self::unimplemented()
    }

    async fn publish(&self, _topic: &Topic, _envelope: &Envelope) -> Result<String, TransportError> {
        Self::unimplemented()
    }

    async fn subscribe(
        &self,
        _topic: &Topic,
        _options: SubscribeOptions,
    ) -> Result<Subscription, TransportError> {
        Self::unimplemented()
    }

    async fn request(
        &self,
        _topic: &Topic,
        _envelope: &Envelope,
        _timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        Self::unimplemented()
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), TransportError> {
        Self::unimplemented()
    }

    async fn nack(&self, _delivery: &Delivery) -> Result<(), TransportError> {
        Self::unimplemented()
    }

    async fn reject(&self, _delivery: &Delivery, _reason: &str) -> Result<(), TransportError> {
        Self::unimplemented()
    }

    async fn create_topic(&self, _topic: &Topic) -> Result<(), TransportError> {
        Self::unimplemented()
    }

    async fn delete_topic(&self, _topic: &Topic) -> Result<(), TransportError> {
        Self::unimplemented()
    }

    async fn purge_topic(&self, _topic: &Topic) -> Result<u64, TransportError> {
        Self::unimplemented()
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        Self::unimplemented()
    }

    async fn health_check(&self) -> Result<ComponentHealth, TransportError> {
        Ok(ComponentHealth::unhealthy("nats variant not implemented"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_operation_answers_not_implemented() {
        let transport = NatsTransport::new();
        assert_eq!(transport.connect().await.unwrap_err().code(), "not_implemented");
        assert_eq!(transport.stats().await.unwrap_err().code(), "not_implemented");
    }
}
