use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;

use crate::{
    message::{DeliveryReceipt, SendRequest},
    plugin::{ChannelTransport, TransportError},
};

/// Accepts everything and remembers what it was asked to send.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<SendRequest>>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn contents(&self) -> Vec<String> {
        self.sent().into_iter().map(|r| r.content).collect()
    }
}

#[async_trait]
impl ChannelTransport for RecordingTransport {
    fn name(&self) -> String {
        "recording".to_string()
    }

    async fn send(&self, request: SendRequest) -> Result<DeliveryReceipt, TransportError> {
        let delivery_id = format!("dlv-{}", request.message_id);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(request);
        }
        Ok(DeliveryReceipt::new(delivery_id))
    }
}

/// Fails the first `failures` attempts, then delivers. `usize::MAX` never delivers.
#[derive(Clone)]
pub struct FlakyTransport {
    failures: usize,
    attempts: Arc<AtomicUsize>,
}

impl FlakyTransport {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            attempts: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelTransport for FlakyTransport {
    fn name(&self) -> String {
        "flaky".to_string()
    }

    async fn send(&self, request: SendRequest) -> Result<DeliveryReceipt, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(TransportError::Failed(format!(
                "attempt {} for {} refused",
                attempt + 1,
                request.message_id
            )));
        }
        Ok(DeliveryReceipt::generated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_transport_keeps_requests() {
        let transport = RecordingTransport::new();
        transport
            .send(SendRequest::new("m1", "wa", "+1", "hi"))
            .await
            .unwrap();
        assert_eq!(transport.contents(), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_flaky_transport_recovers() {
        let transport = FlakyTransport::new(1);
        assert!(transport.send(SendRequest::new("m1", "wa", "+1", "hi")).await.is_err());
        assert!(transport.send(SendRequest::new("m1", "wa", "+1", "hi")).await.is_ok());
        assert_eq!(transport.attempts(), 2);
    }
}
