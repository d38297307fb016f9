//! Outbound webhooks: fan-out, signing, tracked delivery.

mod dispatcher;
mod signature;
mod transport;

pub use dispatcher::{DeliveryJob, WebhookDispatcher, headers};
pub use signature::{sign, verify_signature};
pub use transport::{HttpTransport, TransportResponse, WebhookTransport};

use crate::jobs::QueueError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Client(String),
}
