//! Outbound transport seam.
//!
//! The coordinator hands finished wire envelopes to a `Transport` and only
//! cares whether delivery succeeded. Inbound envelopes arrive the other way,
//! through `DeliveryCoordinator::receive`.

use async_trait::async_trait;
use thiserror::Error;

use pcm_crypto::envelope::WireEnvelope;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("transport closed")]
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one envelope. `Ok(())` means the peer side accepted it.
    async fn send(&self, envelope: WireEnvelope) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(&self, envelope: WireEnvelope) -> Result<(), TransportError> {
        (**self).send(envelope).await
    }
}
