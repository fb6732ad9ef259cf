use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::StreamParams;
use crate::entry::{Entry, Metadata};

/// Opaque identity of one subscriber socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure to hand something to a subscriber
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber {0} is gone")]
    Gone(SubscriberId),

    #[error("failed to deliver to subscriber {subscriber}: {reason}")]
    Failed {
        subscriber: SubscriberId,
        reason: String,
    },
}

/// Outbound side of a subscriber connection.
///
/// The stream controller only ever talks to subscribers through this trait;
/// the wire format is the implementation's business.
#[async_trait]
pub trait SubscriberTransport: Send + Sync {
    async fn send_entry(
        &self,
        subscriber: SubscriberId,
        entry: &Entry,
        params: &StreamParams,
    ) -> Result<(), DeliveryError>;

    async fn send_metadata(
        &self,
        subscriber: SubscriberId,
        metadata: &Metadata,
    ) -> Result<(), DeliveryError>;

    async fn send_toast_error(
        &self,
        subscriber: SubscriberId,
        message: &str,
    ) -> Result<(), DeliveryError>;

    /// Disconnect the subscriber and forget it
    async fn cleanup_socket(&self, subscriber: SubscriberId);
}
