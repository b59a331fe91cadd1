//! Canonical artwork sizes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ArtworkError;

/// Resized derivative of a source image.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SizeVariant {
    /// Source image, only capped at [`SizeVariant::MAX_DIMENSION`].
    Original,
    /// 192px square.
    Large,
    /// 64px square. Unknown sizes fall back to this.
    Medium,
    /// 48px square.
    Small,
    /// 80px square.
    Thumbnail,
}

impl SizeVariant {
    /// Every variant, in directory-creation order.
    pub const ALL: [SizeVariant; 5] = [
        SizeVariant::Original,
        SizeVariant::Large,
        SizeVariant::Medium,
        SizeVariant::Small,
        SizeVariant::Thumbnail,
    ];

    /// Longest edge of the original is capped at this many pixels.
    pub const MAX_DIMENSION: u32 = 4096;

    /// Lowercase name, also the on-disk directory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeVariant::Original => "original",
            SizeVariant::Large => "large",
            SizeVariant::Medium => "medium",
            SizeVariant::Small => "small",
            SizeVariant::Thumbnail => "thumbnail",
        }
    }

    /// Exact canonical name only; see [`SizeVariant::normalize`] for lenient input.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "original" => Some(SizeVariant::Original),
            "large" => Some(SizeVariant::Large),
            "medium" => Some(SizeVariant::Medium),
            "small" => Some(SizeVariant::Small),
            "thumbnail" => Some(SizeVariant::Thumbnail),
            _ => None,
        }
    }

    /// Maps a caller-supplied size onto the canonical set.
    ///
    /// Accepts the canonical names case-insensitively plus the `thumb`
    /// shorthand used by templates. Anything else resolves to `Medium`.
    pub fn normalize(value: &str) -> Self {
        let lowered = value.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "thumb" => SizeVariant::Thumbnail,
            other => Self::parse(other).unwrap_or(SizeVariant::Medium),
        }
    }

    /// Square edge length in pixels, `None` for the unresized original.
    pub fn dimension(&self) -> Option<u32> {
        match self {
            SizeVariant::Original => None,
            SizeVariant::Large => Some(192),
            SizeVariant::Medium => Some(64),
            SizeVariant::Small => Some(48),
            SizeVariant::Thumbnail => Some(80),
        }
    }

    /// JPEG quality used when encoding this variant.
    pub fn jpeg_quality(&self) -> u8 {
        match self {
            SizeVariant::Original => 95,
            SizeVariant::Large => 90,
            SizeVariant::Medium | SizeVariant::Small => 85,
            SizeVariant::Thumbnail => 80,
        }
    }
}

impl fmt::Display for SizeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SizeVariant {
    type Err = ArtworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| {
            ArtworkError::validation(format!("Invalid size variant: {s}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_maps_aliases_and_defaults_to_medium() {
        assert_eq!(SizeVariant::normalize("thumb"), SizeVariant::Thumbnail);
        assert_eq!(SizeVariant::normalize("LARGE"), SizeVariant::Large);
        assert_eq!(SizeVariant::normalize("huge"), SizeVariant::Medium);
        assert_eq!(SizeVariant::normalize(""), SizeVariant::Medium);
    }

    #[test]
    fn strict_parse_rejects_unknown_variants() {
        assert!("gigantic".parse::<SizeVariant>().is_err());
        assert_eq!(
            "small".parse::<SizeVariant>().ok(),
            Some(SizeVariant::Small)
        );
    }
}
