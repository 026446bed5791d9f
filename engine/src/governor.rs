//! Payload governance: keep requests inside backend limits.
//!
//! Two concerns live here: compressing oversized images before they go on
//! the wire, and deciding when a conversation has grown past the point
//! where the backend will keep accepting it.

use std::io::Cursor;

use atelier_types::{ContentPart, HistoryEntry, MediaData};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

const JPEG_QUALITY_START: u8 = 85;
const JPEG_QUALITY_STEP: u8 = 10;
const JPEG_QUALITY_FLOOR: u8 = 35;

/// Limits the governor enforces. Constants live here; values are
/// configuration.
#[derive(Debug, Clone)]
pub struct GovernorLimits {
    /// Per-image payload cap after compression.
    pub per_item_cap_bytes: usize,
    /// Message count threshold for the conversation limit.
    pub message_limit: usize,
    /// Cumulative raw image bytes threshold for the conversation limit.
    pub image_byte_limit: u64,
}

impl Default for GovernorLimits {
    fn default() -> Self {
        Self {
            per_item_cap_bytes: 1024 * 1024,
            message_limit: 10,
            image_byte_limit: 100 * 1024 * 1024,
        }
    }
}

/// Result of the conversation-limit check.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitVerdict {
    pub need_new_conversation: bool,
    pub message_count: usize,
    pub image_size_mb: f64,
}

/// Decide whether this conversation can accept another request.
///
/// The limit trips only when BOTH thresholds are reached: long text-only
/// conversations and short image-heavy ones both remain fine. Sizes count
/// raw (pre-compression) bytes; offloaded parts contribute their recorded
/// full size.
#[must_use]
pub fn check_conversation_limit(
    history: &[HistoryEntry],
    limits: &GovernorLimits,
) -> LimitVerdict {
    let message_count = history.len();
    let image_bytes: u64 = history.iter().map(HistoryEntry::raw_media_bytes).sum();

    LimitVerdict {
        need_new_conversation: message_count >= limits.message_limit
            && image_bytes >= limits.image_byte_limit,
        message_count,
        image_size_mb: image_bytes as f64 / BYTES_PER_MB,
    }
}

/// Compress oversized inline images in `history`, returning fresh entries.
///
/// Text parts and offloaded parts pass through unchanged. Images that
/// cannot be decoded (or compress to nothing) are dropped with a warning;
/// entries left without parts are dropped entirely. Output images are
/// always at or under the cap, which makes this a fixpoint: running it on
/// its own output changes nothing.
#[must_use]
pub fn compress_history(history: &[HistoryEntry], limits: &GovernorLimits) -> Vec<HistoryEntry> {
    let mut out = Vec::with_capacity(history.len());

    for entry in history {
        let mut parts = Vec::with_capacity(entry.parts.len());
        for part in &entry.parts {
            match part {
                ContentPart::Text(_) => parts.push(part.clone()),
                ContentPart::Media(media) => match &media.data {
                    MediaData::Offloaded { .. } => parts.push(part.clone()),
                    MediaData::Inline { bytes } if bytes.len() <= limits.per_item_cap_bytes => {
                        parts.push(part.clone());
                    }
                    MediaData::Inline { bytes } => {
                        match compress_image(bytes, limits.per_item_cap_bytes) {
                            Some(compressed) => {
                                let mut media = media.clone();
                                media.data = MediaData::Inline { bytes: compressed };
                                media.mime_type = "image/jpeg".to_string();
                                parts.push(ContentPart::Media(media));
                            }
                            None => {
                                tracing::warn!(
                                    message_id = %entry.id,
                                    size = bytes.len(),
                                    "Dropping image that cannot be compressed under the cap"
                                );
                            }
                        }
                    }
                },
            }
        }

        if parts.is_empty() && !entry.parts.is_empty() {
            tracing::warn!(message_id = %entry.id, "Dropping history entry with no usable parts");
            continue;
        }
        out.push(HistoryEntry::new(entry.id, entry.role, parts));
    }

    out
}

/// Re-encode one image to fit under `cap` bytes.
///
/// Strategy: downscale once by `sqrt(cap / size)` so area scales with the
/// byte ratio, then walk the JPEG quality ladder down; if the floor quality
/// still exceeds the cap, halve dimensions until it fits. Returns `None`
/// for undecodable input or when even a 1x1 encode cannot fit.
fn compress_image(bytes: &[u8], cap: usize) -> Option<Vec<u8>> {
    let decoded = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(e) => {
            tracing::warn!(%e, "Failed to decode image for compression");
            return None;
        }
    };

    let scale = (cap as f64 / bytes.len() as f64).sqrt().min(1.0);
    let width = ((decoded.width() as f64 * scale) as u32).max(1);
    let height = ((decoded.height() as f64 * scale) as u32).max(1);
    let mut img = decoded.resize(width, height, FilterType::Triangle).to_rgb8();

    let mut quality = JPEG_QUALITY_START;
    loop {
        if let Some(encoded) = encode_jpeg(&img, quality, cap) {
            return Some(encoded);
        }
        if quality > JPEG_QUALITY_FLOOR {
            quality = quality.saturating_sub(JPEG_QUALITY_STEP).max(JPEG_QUALITY_FLOOR);
            continue;
        }

        // Quality floor reached: halve dimensions until it fits.
        if img.width() == 1 && img.height() == 1 {
            tracing::warn!(cap, "Image cannot be compressed under the cap even at 1x1");
            return None;
        }
        let half_w = (img.width() / 2).max(1);
        let half_h = (img.height() / 2).max(1);
        img = image::imageops::resize(&img, half_w, half_h, FilterType::Triangle);
    }
}

fn encode_jpeg(img: &image::RgbImage, quality: u8, cap: usize) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut cursor = Cursor::new(&mut out);
    let encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
    if let Err(e) = img.write_with_encoder(encoder) {
        tracing::warn!(%e, "JPEG encode failed during compression");
        return None;
    }
    (out.len() <= cap).then_some(out)
}
