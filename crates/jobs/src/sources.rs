//! Generation sources and the item catalog the engine regenerates.
//!
//! Each source is an opaque capability that either yields `{url,
//! confidence}` or fails; the engine chains primary → secondary → static
//! fallback and records which source produced the result.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use giftwell_core::{DomainError, DomainResult};

/// One item of the working set: a gift idea needing a derived image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegenItem {
    /// Stable slug used in checkpoints and logs.
    pub id: String,
    /// The idea text the image is derived for.
    pub idea: String,
}

/// Coarse idea classification driving generation parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdeaCategory {
    Apparel,
    Home,
    Toys,
    Books,
    Experience,
    General,
}

impl IdeaCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdeaCategory::Apparel => "apparel",
            IdeaCategory::Home => "home",
            IdeaCategory::Toys => "toys",
            IdeaCategory::Books => "books",
            IdeaCategory::Experience => "experience",
            IdeaCategory::General => "general",
        }
    }
}

/// Keyword classification of an idea string.
pub fn classify_idea(idea: &str) -> IdeaCategory {
    let lowered = idea.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lowered.contains(w));

    if has(&["scarf", "sweater", "shirt", "sock", "jacket", "hat"]) {
        IdeaCategory::Apparel
    } else if has(&["mug", "candle", "vase", "blanket", "lamp", "plant"]) {
        IdeaCategory::Home
    } else if has(&["lego", "puzzle", "game", "toy", "doll"]) {
        IdeaCategory::Toys
    } else if has(&["book", "novel", "journal", "notebook"]) {
        IdeaCategory::Books
    } else if has(&["ticket", "class", "voucher", "trip", "concert", "spa"]) {
        IdeaCategory::Experience
    } else {
        IdeaCategory::General
    }
}

/// Parameters handed to a generation source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub item_id: String,
    pub idea: String,
    pub category: IdeaCategory,
    /// Search/prompt string built from the idea and its category.
    pub query: String,
}

impl GenerationRequest {
    /// Build parameters for one item: classify, then compose the query.
    pub fn for_item(item: &RegenItem) -> Self {
        let category = classify_idea(&item.idea);
        let query = format!("{} {}", item.idea.trim(), category.as_str());
        Self {
            item_id: item.id.clone(),
            idea: item.idea.clone(),
            category,
            query,
        }
    }
}

/// A derived image asset and how it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedAsset {
    pub url: String,
    /// Source confidence in [0, 1].
    pub confidence: f64,
    pub source: AssetSource,
}

/// Which capability produced an asset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetSource {
    Primary,
    Keyword,
    Static,
}

impl AssetSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetSource::Primary => "primary",
            AssetSource::Keyword => "keyword",
            AssetSource::Static => "static",
        }
    }
}

/// An image generation capability.
pub trait ImageSource: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> DomainResult<GeneratedAsset>;
}

impl<S> ImageSource for Arc<S>
where
    S: ImageSource + ?Sized,
{
    fn generate(&self, request: &GenerationRequest) -> DomainResult<GeneratedAsset> {
        (**self).generate(request)
    }
}

/// Primary AI-style generator.
///
/// Deterministic stand-in for the hosted model endpoint: confidence scales
/// with how much signal the idea text carries, and empty ideas are
/// rejected the way the real endpoint rejects empty prompts.
#[derive(Debug, Default)]
pub struct HeuristicImageSource {
    base_url: String,
}

impl HeuristicImageSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl ImageSource for HeuristicImageSource {
    fn generate(&self, request: &GenerationRequest) -> DomainResult<GeneratedAsset> {
        let words = request.idea.split_whitespace().count();
        if words == 0 {
            return Err(DomainError::validation("empty idea text"));
        }

        // More descriptive ideas produce more confident renders.
        let confidence = (0.5 + 0.1 * words as f64).min(0.95);
        let slug = request.idea.to_lowercase().replace(' ', "-");

        Ok(GeneratedAsset {
            url: format!("{}/render/{}/{slug}", self.base_url, request.category.as_str()),
            confidence,
            source: AssetSource::Primary,
        })
    }
}

/// Secondary keyword-search generator.
#[derive(Debug, Default)]
pub struct KeywordImageSource {
    base_url: String,
}

impl KeywordImageSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl ImageSource for KeywordImageSource {
    fn generate(&self, request: &GenerationRequest) -> DomainResult<GeneratedAsset> {
        if request.query.trim().is_empty() {
            return Err(DomainError::validation("empty search query"));
        }

        let encoded = request.query.to_lowercase().replace(' ', "+");
        Ok(GeneratedAsset {
            url: format!("{}/search?q={encoded}", self.base_url),
            confidence: 0.55,
            source: AssetSource::Keyword,
        })
    }
}

/// Static per-category fallback assets.
#[derive(Debug, Default)]
pub struct StaticAssetSource {
    base_url: String,
}

impl StaticAssetSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl ImageSource for StaticAssetSource {
    fn generate(&self, request: &GenerationRequest) -> DomainResult<GeneratedAsset> {
        Ok(GeneratedAsset {
            url: format!("{}/fallback/{}.jpg", self.base_url, request.category.as_str()),
            confidence: 0.25,
            source: AssetSource::Static,
        })
    }
}

/// Primary → secondary → static fallback resolution.
pub struct SourceChain {
    primary: Box<dyn ImageSource>,
    secondary: Box<dyn ImageSource>,
    fallback: Box<dyn ImageSource>,
}

impl SourceChain {
    pub fn new(
        primary: Box<dyn ImageSource>,
        secondary: Box<dyn ImageSource>,
        fallback: Box<dyn ImageSource>,
    ) -> Self {
        Self {
            primary,
            secondary,
            fallback,
        }
    }

    /// Default chain for dev wiring.
    pub fn heuristic(base_url: &str) -> Self {
        Self::new(
            Box::new(HeuristicImageSource::new(format!("{base_url}/ai"))),
            Box::new(KeywordImageSource::new(format!("{base_url}/images"))),
            Box::new(StaticAssetSource::new(format!("{base_url}/static"))),
        )
    }

    /// Try each source in order; fail only when all three do.
    pub fn resolve(&self, request: &GenerationRequest) -> Result<GeneratedAsset, String> {
        let mut errors = Vec::new();

        for (name, source) in [
            ("primary", &self.primary),
            ("keyword", &self.secondary),
            ("static", &self.fallback),
        ] {
            match source.generate(request) {
                Ok(asset) => return Ok(asset),
                Err(err) => errors.push(format!("{name}: {err}")),
            }
        }

        Err(format!("no source produced an asset ({})", errors.join("; ")))
    }
}

/// The catalog of items the engine regenerates derived assets for.
///
/// The engine only ever writes derived fields back; the items themselves
/// are owned by the source domain.
pub trait IdeaCatalog: Send + Sync {
    /// Items with no derived asset yet.
    fn items_missing_assets(&self) -> DomainResult<Vec<RegenItem>>;

    /// The full working set (force-regeneration).
    fn all_items(&self) -> DomainResult<Vec<RegenItem>>;

    /// One item by id (retry support).
    fn get_item(&self, item_id: &str) -> DomainResult<Option<RegenItem>>;

    /// Write a derived asset back onto an item.
    fn save_asset(&self, item_id: &str, asset: &GeneratedAsset) -> DomainResult<()>;
}

impl<S> IdeaCatalog for Arc<S>
where
    S: IdeaCatalog + ?Sized,
{
    fn items_missing_assets(&self) -> DomainResult<Vec<RegenItem>> {
        (**self).items_missing_assets()
    }

    fn all_items(&self) -> DomainResult<Vec<RegenItem>> {
        (**self).all_items()
    }

    fn get_item(&self, item_id: &str) -> DomainResult<Option<RegenItem>> {
        (**self).get_item(item_id)
    }

    fn save_asset(&self, item_id: &str, asset: &GeneratedAsset) -> DomainResult<()> {
        (**self).save_asset(item_id, asset)
    }
}

/// In-memory catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryIdeaCatalog {
    items: RwLock<Vec<RegenItem>>,
    assets: RwLock<HashMap<String, GeneratedAsset>>,
}

impl InMemoryIdeaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn add_item(&self, item: RegenItem) {
        if let Ok(mut items) = self.items.write() {
            items.push(item);
        }
    }

    pub fn asset_for(&self, item_id: &str) -> Option<GeneratedAsset> {
        self.assets
            .read()
            .ok()
            .and_then(|a| a.get(item_id).cloned())
    }
}

impl IdeaCatalog for InMemoryIdeaCatalog {
    fn items_missing_assets(&self) -> DomainResult<Vec<RegenItem>> {
        let items = self
            .items
            .read()
            .map_err(|_| DomainError::conflict("catalog lock poisoned"))?;
        let assets = self
            .assets
            .read()
            .map_err(|_| DomainError::conflict("catalog lock poisoned"))?;
        Ok(items
            .iter()
            .filter(|i| !assets.contains_key(&i.id))
            .cloned()
            .collect())
    }

    fn all_items(&self) -> DomainResult<Vec<RegenItem>> {
        let items = self
            .items
            .read()
            .map_err(|_| DomainError::conflict("catalog lock poisoned"))?;
        Ok(items.clone())
    }

    fn get_item(&self, item_id: &str) -> DomainResult<Option<RegenItem>> {
        let items = self
            .items
            .read()
            .map_err(|_| DomainError::conflict("catalog lock poisoned"))?;
        Ok(items.iter().find(|i| i.id == item_id).cloned())
    }

    fn save_asset(&self, item_id: &str, asset: &GeneratedAsset) -> DomainResult<()> {
        let mut assets = self
            .assets
            .write()
            .map_err(|_| DomainError::conflict("catalog lock poisoned"))?;
        assets.insert(item_id.to_string(), asset.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, idea: &str) -> RegenItem {
        RegenItem {
            id: id.to_string(),
            idea: idea.to_string(),
        }
    }

    #[test]
    fn classification_buckets_by_keyword() {
        assert_eq!(classify_idea("wool scarf"), IdeaCategory::Apparel);
        assert_eq!(classify_idea("Ceramic Mug"), IdeaCategory::Home);
        assert_eq!(classify_idea("pottery class voucher"), IdeaCategory::Experience);
        assert_eq!(classify_idea("something nice"), IdeaCategory::General);
    }

    #[test]
    fn chain_prefers_primary() {
        let chain = SourceChain::heuristic("https://assets.test");
        let request = GenerationRequest::for_item(&item("item-1", "wool scarf"));

        let asset = chain.resolve(&request).unwrap();
        assert_eq!(asset.source, AssetSource::Primary);
        assert!(asset.confidence > 0.5);
    }

    #[test]
    fn chain_falls_back_when_primary_fails() {
        struct AlwaysFails;
        impl ImageSource for AlwaysFails {
            fn generate(&self, _request: &GenerationRequest) -> DomainResult<GeneratedAsset> {
                Err(DomainError::conflict("generator offline"))
            }
        }

        let chain = SourceChain::new(
            Box::new(AlwaysFails),
            Box::new(KeywordImageSource::new("https://images.test")),
            Box::new(StaticAssetSource::new("https://static.test")),
        );
        let request = GenerationRequest::for_item(&item("item-1", "wool scarf"));

        let asset = chain.resolve(&request).unwrap();
        assert_eq!(asset.source, AssetSource::Keyword);
    }

    #[test]
    fn chain_reports_all_errors_when_everything_fails() {
        struct AlwaysFails;
        impl ImageSource for AlwaysFails {
            fn generate(&self, _request: &GenerationRequest) -> DomainResult<GeneratedAsset> {
                Err(DomainError::conflict("offline"))
            }
        }

        let chain = SourceChain::new(
            Box::new(AlwaysFails),
            Box::new(AlwaysFails),
            Box::new(AlwaysFails),
        );
        let request = GenerationRequest::for_item(&item("item-1", "wool scarf"));

        let err = chain.resolve(&request).unwrap_err();
        assert!(err.contains("primary"));
        assert!(err.contains("keyword"));
        assert!(err.contains("static"));
    }

    #[test]
    fn missing_assets_shrinks_as_assets_land() {
        let catalog = InMemoryIdeaCatalog::new();
        catalog.add_item(item("item-1", "wool scarf"));
        catalog.add_item(item("item-2", "ceramic mug"));

        assert_eq!(catalog.items_missing_assets().unwrap().len(), 2);

        catalog
            .save_asset(
                "item-1",
                &GeneratedAsset {
                    url: "https://img.test/1".to_string(),
                    confidence: 0.9,
                    source: AssetSource::Primary,
                },
            )
            .unwrap();

        let missing = catalog.items_missing_assets().unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, "item-2");
    }
}
