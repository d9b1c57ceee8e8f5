pub mod message;
pub mod plugin;

#[cfg(any(test, feature = "test-utils"))]
pub mod plugin_test_util;

pub use message::{DeliveryReceipt, InboundEvent, InboundMessage, MediaRef, SendRequest};
pub use plugin::{ChannelTransport, TransportError};
