//! Auxiliary read-only data attached to a profile: media assets and cached
//! image-enrichment records for gift-idea strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use giftwell_core::{MediaId, UserId};

/// A media asset uploaded to a profile (photo, mood-board image).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub id: MediaId,
    pub user_id: UserId,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Only public assets ever reach the public projection.
    pub public: bool,
    pub created_at: DateTime<Utc>,
}

/// Cached image-enrichment record for one gift-idea string.
///
/// Produced by the regeneration jobs and read back at projection time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdeaEnrichment {
    /// The idea text this enrichment was computed for.
    pub idea: String,
    pub image_url: String,
    /// Relevance of the image to the idea, in [0, 1].
    pub relevance: f64,
    pub cached_at: DateTime<Utc>,
}
