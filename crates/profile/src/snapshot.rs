//! Point-in-time view of one user's source record.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use giftwell_core::UserId;

use crate::occasion::OccasionPrefs;

/// Immutable snapshot of the mutable profile/preferences aggregate.
///
/// Captured by the write path (or the reconciliation sweep) at enqueue time
/// and carried inside the outbox entry, so the replication worker applies
/// exactly the state that was decided when the event was emitted — even if
/// the source has moved on since (that later write produces its own entry).
///
/// `occasion_prefs` is keyed by the raw, possibly synonym-spelled occasion
/// strings as authored; normalization happens at projection time. A
/// `BTreeMap` keeps key order deterministic for serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub gift_ideas: Vec<String>,
    #[serde(default)]
    pub occasion_prefs: BTreeMap<String, OccasionPrefs>,
    /// Monotonically increasing source version, bumped by every write.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ProfileSnapshot {
    /// Minimal snapshot with required fields only.
    pub fn new(user_id: UserId, display_name: impl Into<String>, version: u64) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            email: None,
            city: None,
            birth_date: None,
            interests: Vec::new(),
            gift_ideas: Vec::new(),
            occasion_prefs: BTreeMap::new(),
            version,
            updated_at: Utc::now(),
        }
    }
}
