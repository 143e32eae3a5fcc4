//! Occasion keys and boundary normalization.
//!
//! Inbound profile data keys its per-occasion preferences by free-form
//! strings ("Valentine's Day", "saint-valentin", "Navidad", ...). The
//! internal model is strongly typed: every known occasion maps to exactly
//! one [`OccasionKey`] variant, and unknown spellings are rejected at the
//! boundary rather than passed through.

use serde::{Deserialize, Serialize};

/// Canonical occasion identity.
///
/// One variant per occasion the public projection understands. Downstream
/// consumers see these canonical keys regardless of how the source record
/// was authored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccasionKey {
    Birthday,
    Christmas,
    ValentinesDay,
    MothersDay,
    FathersDay,
    Anniversary,
}

impl OccasionKey {
    /// Canonical string form used in serialized payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            OccasionKey::Birthday => "birthday",
            OccasionKey::Christmas => "christmas",
            OccasionKey::ValentinesDay => "valentines_day",
            OccasionKey::MothersDay => "mothers_day",
            OccasionKey::FathersDay => "fathers_day",
            OccasionKey::Anniversary => "anniversary",
        }
    }

    /// All known occasions, in canonical payload order.
    pub fn all() -> [OccasionKey; 6] {
        [
            OccasionKey::Birthday,
            OccasionKey::Christmas,
            OccasionKey::ValentinesDay,
            OccasionKey::MothersDay,
            OccasionKey::FathersDay,
            OccasionKey::Anniversary,
        ]
    }
}

impl core::fmt::Display for OccasionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-occasion preference block as authored on the source record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccasionPrefs {
    /// Free-form gift ideas for this occasion.
    #[serde(default)]
    pub ideas: Vec<String>,
    /// Optional budget hint ("under 50", "50-100", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<String>,
    /// Free-form notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Normalize a raw occasion spelling to its canonical key.
///
/// Accepts accented, hyphenated, spaced, apostrophized and translated
/// variants. Returns `None` for spellings outside the known set; callers
/// drop those per the whitelist rule.
pub fn normalize_occasion(raw: &str) -> Option<OccasionKey> {
    let folded = fold_key(raw);
    match folded.as_str() {
        "birthday" | "bday" | "cumpleanos" => Some(OccasionKey::Birthday),
        "christmas" | "xmas" | "noel" | "navidad" => Some(OccasionKey::Christmas),
        "valentines" | "valentinesday" | "valentine" | "saintvalentin" | "sanvalentin" => {
            Some(OccasionKey::ValentinesDay)
        }
        "mothersday" | "diadelamadre" | "fetedesmeres" => Some(OccasionKey::MothersDay),
        "fathersday" | "diadelpadre" | "fetedesperes" => Some(OccasionKey::FathersDay),
        "anniversary" | "aniversario" | "weddinganniversary" => Some(OccasionKey::Anniversary),
        _ => None,
    }
}

/// Fold a raw key to a comparable form: lowercase, diacritics stripped,
/// separators and apostrophes removed.
fn fold_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        let ch = ch.to_lowercase().next().unwrap_or(ch);
        match ch {
            ' ' | '-' | '_' | '\'' | '’' | '.' => continue,
            'á' | 'à' | 'â' | 'ä' | 'ã' => out.push('a'),
            'é' | 'è' | 'ê' | 'ë' => out.push('e'),
            'í' | 'ì' | 'î' | 'ï' => out.push('i'),
            'ó' | 'ò' | 'ô' | 'ö' | 'õ' => out.push('o'),
            'ú' | 'ù' | 'û' | 'ü' => out.push('u'),
            'ñ' => out.push('n'),
            'ç' => out.push('c'),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_spellings_normalize() {
        assert_eq!(normalize_occasion("birthday"), Some(OccasionKey::Birthday));
        assert_eq!(normalize_occasion("christmas"), Some(OccasionKey::Christmas));
        assert_eq!(
            normalize_occasion("valentines_day"),
            Some(OccasionKey::ValentinesDay)
        );
    }

    #[test]
    fn accented_and_hyphenated_variants_normalize() {
        assert_eq!(normalize_occasion("Noël"), Some(OccasionKey::Christmas));
        assert_eq!(
            normalize_occasion("Saint-Valentin"),
            Some(OccasionKey::ValentinesDay)
        );
        assert_eq!(
            normalize_occasion("Día de la Madre"),
            Some(OccasionKey::MothersDay)
        );
        assert_eq!(
            normalize_occasion("Fête des Mères"),
            Some(OccasionKey::MothersDay)
        );
        assert_eq!(
            normalize_occasion("cumpleaños"),
            Some(OccasionKey::Birthday)
        );
    }

    #[test]
    fn apostrophes_and_case_are_ignored() {
        assert_eq!(
            normalize_occasion("Valentine's Day"),
            Some(OccasionKey::ValentinesDay)
        );
        assert_eq!(
            normalize_occasion("MOTHER'S DAY"),
            Some(OccasionKey::MothersDay)
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert_eq!(normalize_occasion("graduation"), None);
        assert_eq!(normalize_occasion(""), None);
        assert_eq!(normalize_occasion("birthday2"), None);
    }

    #[test]
    fn every_variant_round_trips_through_its_canonical_form() {
        for key in OccasionKey::all() {
            assert_eq!(normalize_occasion(key.as_str()), Some(key));
        }
    }
}
