//! Public-facing payload shape.
//!
//! Whitelist-only: fields are copied here explicitly, never passed through
//! from the source record, so private data cannot leak by omission.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use giftwell_core::{MediaId, UserId};
use giftwell_profile::OccasionKey;

/// The read-optimized public view of one profile.
///
/// Collections use deterministic ordering (`BTreeMap` keys, stably sorted
/// vectors) so that serializing the same logical payload always produces
/// the same bytes — and therefore the same checksum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicProfile {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// Derived at projection time from the birth date; never stored on the
    /// source record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default)]
    pub interests: Vec<String>,
    /// Canonically-keyed occasion preferences.
    #[serde(default)]
    pub occasions: BTreeMap<OccasionKey, PublicOccasion>,
    /// Public media, most recent first, capped.
    #[serde(default)]
    pub media: Vec<PublicMedia>,
    /// Enriched gift-idea cards, capped.
    #[serde(default)]
    pub idea_cards: Vec<IdeaCard>,
}

/// Public slice of one occasion's preferences. Notes stay private.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicOccasion {
    #[serde(default)]
    pub ideas: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<String>,
}

/// Public view of one media asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicMedia {
    pub id: MediaId,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A gift idea paired with its cached enrichment image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdeaCard {
    pub idea: String,
    pub image_url: String,
    pub relevance: f64,
    /// Set when relevance fell below the confidence threshold and the image
    /// should be treated as a generic stand-in.
    pub fallback: bool,
}
