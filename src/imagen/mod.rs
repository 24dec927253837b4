//! Image generation service
//!
//! [`ImageGenerator`] is the seam between command handling and the model
//! provider; [`GeminiImageClient`] is the production implementation.

mod gemini;

pub use gemini::GeminiImageClient;

use crate::collect::ImageItem;
use async_trait::async_trait;
use thiserror::Error;

/// Result of a successful generation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GeneratedImages {
    /// Generated image files, in candidate order
    pub images: Vec<Vec<u8>>,
    /// Text the model returned alongside the images
    pub texts: Vec<String>,
}

/// Errors of the generation service
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerationError {
    /// The client could not be constructed
    #[error("client configuration error: {0}")]
    Client(String),
    /// The request failed (network, HTTP status or malformed response)
    #[error("{0}")]
    Request(String),
    /// The prompt was blocked
    #[error("prompt blocked: {0}")]
    Blocked(String),
    /// The response had no candidates at all
    #[error("no candidates received")]
    NoCandidates,
    /// A candidate stopped without producing content
    #[error("generation stopped: {reason}")]
    AbnormalFinish {
        /// Finish reason reported for the empty candidate
        reason: String,
        /// Text returned by the candidates before it
        texts: Vec<String>,
    },
    /// Candidates were returned but none contained an image
    #[error("no images generated")]
    NoImages {
        /// Text the model returned instead, often a refusal
        texts: Vec<String>,
    },
}

impl GenerationError {
    /// Text the model returned before the generation failed.
    #[must_use]
    pub fn texts(&self) -> &[String] {
        match self {
            Self::AbnormalFinish { texts, .. } | Self::NoImages { texts } => texts,
            _ => &[],
        }
    }
}

/// Generates or edits images from a prompt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generate `candidate_count` candidates for `prompt`.
    ///
    /// With a non-empty `images` slice the request is an edit of those images.
    ///
    /// # Errors
    ///
    /// Returns a [`GenerationError`] describing why nothing usable came back.
    async fn generate(
        &self,
        prompt: &str,
        images: &[ImageItem],
        candidate_count: u32,
    ) -> Result<GeneratedImages, GenerationError>;
}
