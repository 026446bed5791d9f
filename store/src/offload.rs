//! Offload policy: when media leaves history and how it comes back.

use std::io::Cursor;

use anyhow::{Context, Result};
use image::ImageFormat;
use image::codecs::jpeg::JpegEncoder;

use atelier_types::{ContentPart, ImageId, MediaData, MediaPart, MessageId};

use crate::store::{MediaRecord, MediaStore};

/// Inline media at or above this size is moved to the store.
///
/// Deliberately above the payload governor's per-item cap: offload is about
/// keeping history lean in memory, not about request payload size.
pub const OFFLOAD_THRESHOLD_BYTES: usize = 4 * 1024 * 1024;

const THUMBNAIL_MAX_DIM: u32 = 512;
const THUMBNAIL_JPEG_QUALITY: u8 = 75;

/// Result of running offload over one message's parts.
#[derive(Debug)]
pub struct OffloadOutcome {
    pub parts: Vec<ContentPart>,
    /// True if any part was rewritten; callers skip re-persisting otherwise.
    pub changed: bool,
}

/// Media bytes ready for display or replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Move oversized inline media in `parts` into the store.
///
/// Each offloaded part keeps a thumbnail and a deterministic id derived from
/// the owning message and part index, so repeated runs overwrite rather than
/// duplicate. Parts below the threshold and parts already offloaded are
/// untouched.
pub fn offload_parts(
    store: &MediaStore,
    owner: MessageId,
    parts: Vec<ContentPart>,
) -> Result<OffloadOutcome> {
    offload_parts_with(store, owner, parts, OFFLOAD_THRESHOLD_BYTES)
}

/// [`offload_parts`] with an explicit threshold (configuration hook).
pub fn offload_parts_with(
    store: &MediaStore,
    owner: MessageId,
    parts: Vec<ContentPart>,
    threshold_bytes: usize,
) -> Result<OffloadOutcome> {
    let mut changed = false;
    let mut out = Vec::with_capacity(parts.len());

    for (index, part) in parts.into_iter().enumerate() {
        let mut media = match part {
            ContentPart::Media(media) => media,
            text => {
                out.push(text);
                continue;
            }
        };

        let MediaData::Inline { bytes } = &media.data else {
            out.push(ContentPart::Media(media));
            continue;
        };

        if bytes.len() < threshold_bytes {
            out.push(ContentPart::Media(media));
            continue;
        }

        let thumbnail = match make_thumbnail(bytes, &media.mime_type) {
            Ok(thumbnail) => thumbnail,
            Err(e) => {
                tracing::warn!(%e, mime_type = %media.mime_type, "Cannot thumbnail media, leaving inline");
                out.push(ContentPart::Media(media));
                continue;
            }
        };

        let id = ImageId::derive(owner, index);
        let full_size = bytes.len() as u64;
        store.put(&MediaRecord {
            id: id.clone(),
            mime_type: media.mime_type.clone(),
            bytes: bytes.clone(),
        })?;

        media.data = MediaData::Offloaded {
            id,
            thumbnail,
            full_size,
        };
        changed = true;
        out.push(ContentPart::Media(media));
    }

    Ok(OffloadOutcome {
        parts: out,
        changed,
    })
}

/// Full-resolution bytes for a part, if it has any media.
///
/// Offloaded parts read from the store; on a miss (evicted or deleted
/// out-of-band) the thumbnail the part still carries is returned so callers
/// can always render something. Safe to call repeatedly.
#[must_use]
pub fn resolve_media(store: &MediaStore, part: &ContentPart) -> Option<ResolvedMedia> {
    let media = part.as_media()?;
    match &media.data {
        MediaData::Inline { bytes } => Some(ResolvedMedia {
            mime_type: media.mime_type.clone(),
            bytes: bytes.clone(),
        }),
        MediaData::Offloaded { id, thumbnail, .. } => {
            match store.get(id) {
                Ok(Some(record)) => Some(ResolvedMedia {
                    mime_type: record.mime_type,
                    bytes: record.bytes,
                }),
                Ok(None) => {
                    tracing::warn!(%id, "Offloaded media missing from store, using thumbnail");
                    thumbnail_fallback(media, thumbnail)
                }
                Err(e) => {
                    tracing::warn!(%id, %e, "Media store read failed, using thumbnail");
                    thumbnail_fallback(media, thumbnail)
                }
            }
        }
    }
}

fn thumbnail_fallback(media: &MediaPart, thumbnail: &[u8]) -> Option<ResolvedMedia> {
    if thumbnail.is_empty() {
        return None;
    }
    Some(ResolvedMedia {
        mime_type: thumbnail_mime(&media.mime_type).to_string(),
        bytes: thumbnail.to_vec(),
    })
}

fn thumbnail_mime(source_mime: &str) -> &'static str {
    if source_mime.eq_ignore_ascii_case("image/png") {
        "image/png"
    } else {
        "image/jpeg"
    }
}

/// Derive a display thumbnail, max dimension [`THUMBNAIL_MAX_DIM`].
///
/// PNG input stays PNG so transparency survives; everything else re-encodes
/// as JPEG at quality 75.
fn make_thumbnail(bytes: &[u8], mime_type: &str) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes).context("Failed to decode media for thumbnail")?;
    let thumb = img.thumbnail(THUMBNAIL_MAX_DIM, THUMBNAIL_MAX_DIM);

    let mut out = Vec::new();
    if thumbnail_mime(mime_type) == "image/png" {
        thumb
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .context("Failed to encode PNG thumbnail")?;
    } else {
        let encoder = JpegEncoder::new_with_quality(&mut out, THUMBNAIL_JPEG_QUALITY);
        thumb
            .to_rgb8()
            .write_with_encoder(encoder)
            .context("Failed to encode JPEG thumbnail")?;
    }
    Ok(out)
}
