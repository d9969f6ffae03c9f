use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;

use crate::process::Platform;

/// Height ceilings offered next to "best", highest first
pub const TIER_CEILINGS: [u32; 3] = [1080, 720, 360];

/// One downloadable stream variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingDescriptor {
    pub format_id: String,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub filesize: Option<u64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub format_note: Option<String>,
}

impl EncodingDescriptor {
    /// Known height, else the number in a "720p"-style label
    pub fn effective_height(&self) -> Option<u32> {
        self.height
            .filter(|h| *h > 0)
            .or_else(|| self.resolution.as_deref().and_then(parse_height_label))
    }
}

/// Coarse quality choice for the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierLabel {
    Best,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "360p")]
    P360,
}

impl TierLabel {
    fn for_ceiling(ceiling: u32) -> Self {
        match ceiling {
            1080 => TierLabel::P1080,
            720 => TierLabel::P720,
            _ => TierLabel::P360,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TierLabel::Best => "best",
            TierLabel::P1080 => "1080p",
            TierLabel::P720 => "720p",
            TierLabel::P360 => "360p",
        }
    }
}

impl std::fmt::Display for TierLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityTier {
    pub label: TierLabel,
    pub format_id: String,
    pub height: u32,
}

/// Normalized inspection result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectResult {
    pub title: String,
    pub thumbnail: Option<String>,
    pub formats: Vec<EncodingDescriptor>,
    pub tiers: Vec<QualityTier>,
}

/// The parts of the extractor's metadata dump we read. A field of the wrong type is treated as
/// missing so one odd value does not discard the rest of the document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInfo {
    #[serde(deserialize_with = "lenient")]
    id: Option<serde_json::Value>,
    #[serde(deserialize_with = "lenient")]
    title: Option<String>,
    #[serde(deserialize_with = "lenient")]
    thumbnail: Option<String>,
    #[serde(deserialize_with = "lenient_seq")]
    thumbnails: Vec<RawThumbnail>,
    #[serde(deserialize_with = "lenient_seq")]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawThumbnail {
    #[serde(deserialize_with = "lenient")]
    url: Option<String>,
    #[serde(deserialize_with = "lenient")]
    width: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    height: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFormat {
    #[serde(deserialize_with = "lenient")]
    format_id: Option<serde_json::Value>,
    #[serde(deserialize_with = "lenient")]
    ext: Option<String>,
    #[serde(deserialize_with = "lenient")]
    resolution: Option<String>,
    #[serde(deserialize_with = "lenient")]
    width: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    height: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    fps: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    filesize: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    filesize_approx: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    vcodec: Option<String>,
    #[serde(deserialize_with = "lenient")]
    acodec: Option<String>,
    #[serde(deserialize_with = "lenient")]
    format_note: Option<String>,
}

/// The field's value, or its default when the type does not match
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

/// Array elements that match, skipping the rest; anything but an array is empty
fn lenient_seq<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let items = match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Array(items) => items,
        _ => return Ok(Vec::new()),
    };
    Ok(items
        .into_iter()
        .filter_map(|item| T::deserialize(item).ok())
        .collect())
}

/// Turn a raw metadata document into title, thumbnail, encodings and tiers
pub fn resolve(payload: &serde_json::Value, platform: Platform) -> InspectResult {
    let raw = RawInfo::deserialize(payload).unwrap_or_else(|e| {
        tracing::warn!("Metadata did not match the expected shape: {}", e);
        RawInfo::default()
    });

    let id = raw.id.as_ref().and_then(value_to_string);
    let thumbnail = select_thumbnail(&raw, platform, id.as_deref());

    let mut seen = HashSet::new();
    let mut formats: Vec<EncodingDescriptor> = raw
        .formats
        .iter()
        .filter_map(|f| describe(f, platform))
        .filter(|d| seen.insert(d.format_id.clone()))
        .collect();

    // highest first, unknown heights last
    formats.sort_by_key(|d| std::cmp::Reverse(d.effective_height().unwrap_or(0)));

    let tiers = derive_tiers(&formats);

    InspectResult {
        title: raw.title.unwrap_or_default(),
        thumbnail,
        formats,
        tiers,
    }
}

/// Content id from a metadata document, if present
pub fn content_id(payload: &serde_json::Value) -> Option<String> {
    payload.get("id").and_then(value_to_string)
}

fn describe(raw: &RawFormat, platform: Platform) -> Option<EncodingDescriptor> {
    let format_id = raw.format_id.as_ref().and_then(value_to_string)?;

    if !has_track(&raw.vcodec) {
        return None;
    }
    if platform.requires_muxed_audio() && !has_track(&raw.acodec) {
        return None;
    }

    let width = raw.width.filter(|w| *w > 0.0).map(|w| w as u32);
    let height = raw.height.filter(|h| *h > 0.0).map(|h| h as u32);

    let resolution = raw
        .resolution
        .clone()
        .filter(|r| !r.is_empty())
        .or_else(|| height.map(|h| format!("{h}p")));

    let filesize = [raw.filesize, raw.filesize_approx]
        .into_iter()
        .flatten()
        .find(|size| *size > 0.0)
        .map(|size| size as u64);

    Some(EncodingDescriptor {
        format_id,
        ext: raw.ext.clone(),
        resolution,
        width,
        height,
        fps: raw.fps,
        filesize,
        vcodec: raw.vcodec.clone(),
        acodec: raw.acodec.clone(),
        format_note: raw.format_note.clone(),
    })
}

fn has_track(codec: &Option<String>) -> bool {
    matches!(codec.as_deref(), Some(c) if !c.is_empty() && c != "none")
}

fn select_thumbnail(raw: &RawInfo, platform: Platform, id: Option<&str>) -> Option<String> {
    let mut largest: Option<(&str, f64)> = None;
    for thumb in &raw.thumbnails {
        let Some(url) = thumb.url.as_deref().filter(|u| !u.is_empty()) else {
            continue;
        };
        let area = thumb.width.unwrap_or(0.0) * thumb.height.unwrap_or(0.0);
        if largest.map_or(true, |(_, best)| area > best) {
            largest = Some((url, area));
        }
    }

    largest
        .map(|(url, _)| url.to_string())
        .or_else(|| raw.thumbnail.clone().filter(|t| !t.is_empty()))
        .or_else(|| id.and_then(|id| platform.default_thumbnail(id)))
}

/// Pick best / <=1080p / <=720p / <=360p, dropping tiers that repeat an encoding
pub fn derive_tiers(encodings: &[EncodingDescriptor]) -> Vec<QualityTier> {
    let mut ranked: Vec<(u32, &EncodingDescriptor)> = encodings
        .iter()
        .filter_map(|e| e.effective_height().map(|h| (h, e)))
        .collect();
    ranked.sort_by_key(|(h, _)| std::cmp::Reverse(*h));

    let Some(&(best_height, best)) = ranked.first() else {
        return Vec::new();
    };

    let mut picks = vec![(TierLabel::Best, best_height, best)];
    for ceiling in TIER_CEILINGS {
        let pick = ranked
            .iter()
            .find(|(h, _)| *h <= ceiling)
            .or_else(|| ranked.last())
            .copied();
        if let Some((height, encoding)) = pick {
            picks.push((TierLabel::for_ceiling(ceiling), height, encoding));
        }
    }

    let mut seen = HashSet::new();
    picks
        .into_iter()
        .filter(|(_, _, e)| seen.insert(e.format_id.as_str()))
        .map(|(label, height, e)| QualityTier {
            label,
            format_id: e.format_id.clone(),
            height,
        })
        .collect()
}

fn parse_height_label(label: &str) -> Option<u32> {
    let bytes = label.as_bytes();
    bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'p')
        .find_map(|(end, _)| {
            let start = bytes[..end]
                .iter()
                .rposition(|b| !b.is_ascii_digit())
                .map_or(0, |pos| pos + 1);
            label[start..end].parse::<u32>().ok().filter(|h| *h > 0)
        })
}

fn value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
