//! Candidate selection

use std::collections::HashSet;

use crate::content::ImageSources;
use crate::types::{ImageCandidate, ImageSourceKind};

/// Order the content's images by preference.
///
/// Social image first, then the featured image, then media items with any
/// item flagged as featured ahead of the rest (which keep their declared
/// order). Duplicate URLs keep their first, highest-priority position.
pub fn select_candidates(sources: &ImageSources) -> Vec<ImageCandidate> {
    let mut ordered: Vec<(&str, ImageSourceKind)> = Vec::new();

    if let Some(url) = &sources.social {
        ordered.push((url.as_str(), ImageSourceKind::Social));
    }
    if let Some(url) = &sources.featured {
        ordered.push((url.as_str(), ImageSourceKind::Featured));
    }

    let mut media: Vec<_> = sources.media.iter().collect();
    // stable sort keeps declaration order among equal keys
    media.sort_by_key(|item| (!item.is_featured, item.order));
    ordered.extend(media.into_iter().map(|item| (item.url.as_str(), ImageSourceKind::MediaItem)));

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for (url, source) in ordered {
        let url = url.trim();
        if url.is_empty() || !seen.insert(url.to_string()) {
            continue;
        }
        candidates.push(ImageCandidate::new(url, candidates.len() as u32, source));
    }

    candidates
}
