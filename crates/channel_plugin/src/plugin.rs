use async_trait::async_trait;
use thiserror::Error;

use crate::message::{DeliveryReceipt, SendRequest};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel `{0}` is not connected")]
    NotConnected(String),
    #[error("recipient rejected the message: {0}")]
    Rejected(String),
    #[error("send timed out after {0} ms")]
    Timeout(u64),
    #[error("transport failure: {0}")]
    Failed(String),
}

/// The one trait channel adapters implement (WhatsApp, Instagram, ...).
///
/// A transport only delivers. Pacing, daily caps and retries are handled by
/// the dispatch queue in front of it, so `send` should make a single attempt
/// and report the outcome.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// The name of the adapter, used in logs.
    fn name(&self) -> String;

    /// Push one message out.
    async fn send(&self, request: SendRequest) -> Result<DeliveryReceipt, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            TransportError::NotConnected("wa-main".into()).to_string(),
            "channel `wa-main` is not connected"
        );
        assert_eq!(TransportError::Timeout(1500).to_string(), "send timed out after 1500 ms");
    }
}
