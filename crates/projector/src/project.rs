//! Snapshot → public payload projection.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::warn;

use giftwell_profile::{
    normalize_occasion, IdeaEnrichment, MediaAsset, OccasionKey, ProfileSnapshot,
};

use crate::checksum::payload_checksum;
use crate::payload::{IdeaCard, PublicMedia, PublicOccasion, PublicProfile};
use crate::sources::{EnrichmentCache, MediaCatalog};

/// Enrichment relevance below this is marked as a fallback image.
pub const RELEVANCE_THRESHOLD: f64 = 0.5;

/// Public media cap per profile.
const MEDIA_CAP: usize = 8;

/// Gift-idea enrichment cap per profile.
const IDEA_CAP: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectError {
    #[error("payload serialization failed: {0}")]
    Serialize(String),
}

/// A projected payload together with its content checksum.
#[derive(Debug, Clone, PartialEq)]
pub struct Projected {
    pub payload: PublicProfile,
    pub checksum: String,
}

/// Project a source snapshot into the public payload.
///
/// Pure and deterministic: the same snapshot, auxiliary data and `as_of`
/// date always produce the same payload and checksum, regardless of the
/// order `media` or `enrichments` were fetched in.
pub fn project(
    snapshot: &ProfileSnapshot,
    media: &[MediaAsset],
    enrichments: &[IdeaEnrichment],
    as_of: NaiveDate,
) -> Result<Projected, ProjectError> {
    let payload = PublicProfile {
        user_id: snapshot.user_id,
        display_name: snapshot.display_name.clone(),
        city: snapshot.city.clone(),
        age: snapshot.birth_date.and_then(|b| derive_age(b, as_of)),
        interests: snapshot.interests.clone(),
        occasions: normalize_occasions(snapshot),
        media: select_media(snapshot, media),
        idea_cards: select_idea_cards(snapshot, enrichments),
    };

    let checksum = payload_checksum(&payload)?;
    Ok(Projected { payload, checksum })
}

/// Whole years between `birth_date` and `as_of`. `None` for future dates.
fn derive_age(birth_date: NaiveDate, as_of: NaiveDate) -> Option<u32> {
    if birth_date > as_of {
        return None;
    }
    let mut age = as_of.years_since(birth_date)?;
    // years_since is already birthday-aware; clamp stays for paranoia-free casts.
    if age > u32::from(u16::MAX) {
        age = u32::from(u16::MAX);
    }
    Some(age)
}

/// Collapse raw occasion keys onto the canonical set, dropping unknown
/// spellings. When two raw spellings collapse onto the same canonical key,
/// their ideas are merged in source order and the first budget wins.
fn normalize_occasions(snapshot: &ProfileSnapshot) -> BTreeMap<OccasionKey, PublicOccasion> {
    let mut out: BTreeMap<OccasionKey, PublicOccasion> = BTreeMap::new();

    for (raw_key, prefs) in &snapshot.occasion_prefs {
        let Some(key) = normalize_occasion(raw_key) else {
            continue;
        };

        let slot = out.entry(key).or_default();
        for idea in &prefs.ideas {
            if !slot.ideas.contains(idea) {
                slot.ideas.push(idea.clone());
            }
        }
        if slot.budget.is_none() {
            slot.budget = prefs.budget.clone();
        }
    }

    out
}

/// Public media for the user, most recent first (id as stable tiebreak),
/// capped at [`MEDIA_CAP`].
fn select_media(snapshot: &ProfileSnapshot, media: &[MediaAsset]) -> Vec<PublicMedia> {
    let mut selected: Vec<&MediaAsset> = media
        .iter()
        .filter(|m| m.public && m.user_id == snapshot.user_id)
        .collect();

    selected.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
    selected.truncate(MEDIA_CAP);

    selected
        .into_iter()
        .map(|m| PublicMedia {
            id: m.id,
            url: m.url.clone(),
            caption: m.caption.clone(),
            created_at: m.created_at,
        })
        .collect()
}

/// Enrichment cards for the first [`IDEA_CAP`] gift ideas, deduplicated by
/// idea text keeping the highest relevance.
fn select_idea_cards(snapshot: &ProfileSnapshot, enrichments: &[IdeaEnrichment]) -> Vec<IdeaCard> {
    let mut cards = Vec::new();

    for idea in snapshot.gift_ideas.iter().take(IDEA_CAP) {
        let best = enrichments
            .iter()
            .filter(|e| &e.idea == idea)
            .max_by(|a, b| {
                a.relevance
                    .partial_cmp(&b.relevance)
                    .unwrap_or(core::cmp::Ordering::Equal)
            });

        if let Some(e) = best {
            cards.push(IdeaCard {
                idea: idea.clone(),
                image_url: e.image_url.clone(),
                relevance: e.relevance,
                fallback: e.relevance < RELEVANCE_THRESHOLD,
            });
        }
    }

    cards
}

/// Projection service bound to its auxiliary data sources.
///
/// Lookup failures degrade to empty lists rather than failing the whole
/// projection: a partial public profile is preferable to none.
#[derive(Debug)]
pub struct Projector<M, E> {
    media: M,
    enrichment: E,
}

impl<M, E> Projector<M, E>
where
    M: MediaCatalog,
    E: EnrichmentCache,
{
    pub fn new(media: M, enrichment: E) -> Self {
        Self { media, enrichment }
    }

    /// Project a snapshot, fetching auxiliary data from the bound sources.
    pub fn project_snapshot(
        &self,
        snapshot: &ProfileSnapshot,
        as_of: NaiveDate,
    ) -> Result<Projected, ProjectError> {
        let media = match self.media.public_media(snapshot.user_id) {
            Ok(m) => m,
            Err(err) => {
                warn!(user_id = %snapshot.user_id, error = %err, "media lookup failed, projecting without media");
                Vec::new()
            }
        };

        let ideas: Vec<String> = snapshot.gift_ideas.iter().take(IDEA_CAP).cloned().collect();
        let enrichments = match self.enrichment.lookup(&ideas) {
            Ok(e) => e,
            Err(err) => {
                warn!(user_id = %snapshot.user_id, error = %err, "enrichment lookup failed, projecting without idea cards");
                Vec::new()
            }
        };

        project(snapshot, &media, &enrichments, as_of)
    }
}
