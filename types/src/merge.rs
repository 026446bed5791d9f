//! The part merger: folds raw fragments into an ordered content-part list.
//!
//! Pure and total over well-formed fragments. The merge rule keeps one
//! logical reasoning or answer block as one part instead of fragmenting it
//! across many tiny parts.

use crate::fragment::RawFragment;
use crate::part::{ContentPart, MediaData, MediaPart, TextPart};

/// Fold one fragment into `parts` in place.
///
/// - A text delta appends to the last part iff that part is text-typed and
///   its reasoning flag matches the fragment's; otherwise a new text part is
///   pushed.
/// - Media always becomes its own new part (media is never concatenated).
/// - A present signature overwrites the signature of the part the fragment
///   was merged into; absence leaves the existing one untouched.
/// - A fragment with neither text, media, nor signature is ignored.
pub fn merge_fragment(parts: &mut Vec<ContentPart>, fragment: RawFragment) {
    let RawFragment {
        text,
        media,
        reasoning,
        signature,
    } = fragment;

    if let Some(delta) = text
        && !delta.is_empty()
    {
        match parts.last_mut() {
            Some(ContentPart::Text(last)) if last.reasoning == reasoning => {
                last.text.push_str(&delta);
            }
            _ => parts.push(ContentPart::Text(TextPart {
                text: delta,
                reasoning,
                signature: None,
            })),
        }
    }

    if let Some(inline) = media {
        parts.push(ContentPart::Media(MediaPart {
            data: MediaData::Inline {
                bytes: inline.bytes,
            },
            mime_type: inline.mime_type,
            reasoning,
            source_prompt: None,
            signature: None,
        }));
    }

    if let Some(signature) = signature
        && let Some(last) = parts.last_mut()
    {
        last.set_signature(signature);
    }
}

/// Merge a whole fragment sequence at once.
///
/// Equivalent to applying [`merge_fragment`] incrementally; the single-shot
/// response path uses this.
#[must_use]
pub fn merge_all(fragments: impl IntoIterator<Item = RawFragment>) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    for fragment in fragments {
        merge_fragment(&mut parts, fragment);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::{merge_all, merge_fragment};
    use crate::fragment::RawFragment;
    use crate::part::ContentPart;

    #[test]
    fn consecutive_text_deltas_coalesce() {
        let parts = merge_all([RawFragment::text("Hel"), RawFragment::text("lo")]);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].as_text().unwrap().text, "Hello");
    }

    #[test]
    fn reasoning_flag_change_starts_new_part() {
        let parts = merge_all([
            RawFragment::reasoning("thinking"),
            RawFragment::text("answer"),
            RawFragment::text(" continues"),
        ]);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].is_reasoning());
        assert_eq!(parts[1].as_text().unwrap().text, "answer continues");
    }

    #[test]
    fn media_is_never_concatenated() {
        let parts = merge_all([
            RawFragment::media(vec![1, 2], "image/png"),
            RawFragment::media(vec![3, 4], "image/png"),
        ]);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.as_media().is_some()));
    }

    #[test]
    fn media_after_text_starts_new_part_and_text_resumes_separately() {
        let parts = merge_all([
            RawFragment::text("before"),
            RawFragment::media(vec![9], "image/jpeg"),
            RawFragment::text("after"),
        ]);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].as_text().unwrap().text, "after");
    }

    #[test]
    fn signature_overwrites_last_write_wins() {
        let parts = merge_all([
            RawFragment::text("a").with_signature("first"),
            RawFragment::text("b").with_signature("second"),
        ]);
        assert_eq!(parts.len(), 1);
        let sig = parts[0].as_text().unwrap().signature.as_ref().unwrap();
        assert_eq!(sig.as_str(), "second");
    }

    #[test]
    fn absent_signature_leaves_existing() {
        let parts = merge_all([RawFragment::text("a").with_signature("keep"), RawFragment::text("b")]);
        let sig = parts[0].as_text().unwrap().signature.as_ref().unwrap();
        assert_eq!(sig.as_str(), "keep");
    }

    #[test]
    fn signature_only_fragment_applies_to_last_part() {
        let mut parts = merge_all([RawFragment::text("a")]);
        merge_fragment(&mut parts, RawFragment::default().with_signature("late"));
        let sig = parts[0].as_text().unwrap().signature.as_ref().unwrap();
        assert_eq!(sig.as_str(), "late");
    }

    #[test]
    fn empty_fragment_is_ignored() {
        let parts = merge_all([RawFragment::default()]);
        assert!(parts.is_empty());
    }

    #[test]
    fn incremental_merge_equals_batch_merge() {
        let fragments = vec![
            RawFragment::reasoning("let me "),
            RawFragment::reasoning("think"),
            RawFragment::text("the answer"),
            RawFragment::media(vec![0xFF, 0xD8], "image/jpeg"),
            RawFragment::text("caption").with_signature("sig"),
            RawFragment::reasoning("more thought"),
        ];

        let batch = merge_all(fragments.clone());

        let mut incremental: Vec<ContentPart> = Vec::new();
        for fragment in fragments {
            merge_fragment(&mut incremental, fragment);
        }

        assert_eq!(incremental, batch);
    }
}
