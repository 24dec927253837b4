//! Attachment collection
//!
//! A command that needs input images opens an [`ImageCollector`] through the
//! shared [`SessionRegistry`]. Inbound attachments from the waiting user are
//! routed to it, and `/imagencancel` reaches it by user identity.
//!
//! The collector waits up to a long ceiling for the first attachment and then
//! keeps accepting attachments until a short quiet window passes without new
//! ones, so a multi-photo post ends up as one batch.

mod registry;
mod wait;

pub use registry::{DeliveryHandle, ImageCollector, SessionRegistry};
pub use wait::{wait_for, WaitOutcome};

use crate::config::{Settings, BURST_QUIET_WINDOW_MS, IMAGE_WAIT_TIMEOUT_SECS};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// One inbound attachment.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageItem {
    /// Raw file bytes
    pub data: Vec<u8>,
    /// File name as reported by the transport
    pub filename: String,
    /// MIME type as reported by the transport
    pub mime_type: String,
}

impl ImageItem {
    /// Create a new item.
    #[must_use]
    pub fn new(data: Vec<u8>, filename: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data,
            filename: filename.into(),
            mime_type: mime_type.into(),
        }
    }
}

impl fmt::Debug for ImageItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageItem")
            .field("filename", &self.filename)
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

/// What travels over a session's delivery channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A real attachment
    Item(ImageItem),
    /// Stop collecting without reporting an error
    CancelRequested,
}

/// Timeouts of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectTimeouts {
    /// Long ceiling for the first attachment
    pub first_image: Duration,
    /// Quiet window that closes a burst
    pub quiet_window: Duration,
}

impl Default for CollectTimeouts {
    fn default() -> Self {
        Self {
            first_image: Duration::from_secs(IMAGE_WAIT_TIMEOUT_SECS),
            quiet_window: Duration::from_millis(BURST_QUIET_WINDOW_MS),
        }
    }
}

impl CollectTimeouts {
    /// Timeouts configured in `settings`.
    #[must_use]
    pub const fn from_settings(settings: &Settings) -> Self {
        Self {
            first_image: settings.image_wait_timeout(),
            quiet_window: settings.burst_quiet_window(),
        }
    }
}

/// Successful end of a collection.
#[derive(Debug, PartialEq, Eq)]
pub enum CollectionOutcome {
    /// One or more attachments, in arrival order
    Batch(Vec<ImageItem>),
    /// Cancelled on request; nothing should be reported to the user
    Cancelled,
}

/// Errors of the collection protocol
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollectError {
    /// The first attachment did not arrive in time
    #[error("waiting for image data timeout")]
    TimedOut,
    /// The command was cancelled while waiting (shutdown)
    #[error("waiting for image data aborted")]
    Aborted,
    /// Nobody is waiting for attachments from this user
    #[error("not waiting for image data")]
    NotWaiting,
}
