//! Share text formatting
//!
//! Produces the post commentary from a content item:
//!
//! ```text
//! <title>
//!
//! <excerpt>
//!
//! <url>
//!
//! #Tag1 #Tag2
//! ```
//!
//! All limits are counted in characters, not bytes.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::content::Postable;
use crate::types::FormattedContent;

pub const MAX_POST_CHARS: usize = 3000;
pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_EXCERPT_CHARS: usize = 300;
pub const MAX_HASHTAGS: usize = 5;

/// Excerpt allowance kept when an image accompanies the post
const IMAGE_EXCERPT_FACTOR: f64 = 0.85;

/// Shortest excerpt worth keeping when squeezing the post into its budget
const MIN_EXCERPT_CHARS: usize = 20;

const ELLIPSIS: &str = "...";

static SCRIPT_STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").unwrap());
static BLOCK_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</(p|div|h[1-6]|li|blockquote|pre|section|article)\s*>|<br\s*/?>|<hr\s*/?>")
        .unwrap()
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static NUMERIC_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(?:x([0-9a-fA-F]+)|([0-9]+));").unwrap());
static PARAGRAPH_SPLIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

/// Formats content into share commentary
#[derive(Debug, Clone)]
pub struct ContentFormatter {
    pub max_post_chars: usize,
    pub max_title_chars: usize,
    pub max_excerpt_chars: usize,
    pub max_hashtags: usize,
}

impl Default for ContentFormatter {
    fn default() -> Self {
        Self {
            max_post_chars: MAX_POST_CHARS,
            max_title_chars: MAX_TITLE_CHARS,
            max_excerpt_chars: MAX_EXCERPT_CHARS,
            max_hashtags: MAX_HASHTAGS,
        }
    }
}

impl ContentFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format `content` into post text.
    ///
    /// `with_image` shrinks the excerpt allowance so the text does not
    /// dominate an image post.
    pub fn format(&self, content: &dyn Postable, with_image: bool) -> FormattedContent {
        let title = truncate_at_word(
            &collapse_whitespace(&decode_entities(content.title())),
            self.max_title_chars,
        );
        let url = content.url().trim().to_string();

        let excerpt_limit = if with_image {
            (self.max_excerpt_chars as f64 * IMAGE_EXCERPT_FACTOR) as usize
        } else {
            self.max_excerpt_chars
        };
        let excerpt = derive_excerpt(content, excerpt_limit);
        let hashtags = derive_hashtags(content.tags(), self.max_hashtags);

        let (body, hashtags) = self.fit_budget(&title, &excerpt, &url, hashtags);
        let character_count = body.chars().count();

        FormattedContent {
            title,
            body,
            url,
            hashtags,
            character_count,
        }
    }

    /// Drop hashtags, then shorten the excerpt, then hard-truncate.
    fn fit_budget(
        &self,
        title: &str,
        excerpt: &str,
        url: &str,
        hashtags: Vec<String>,
    ) -> (String, Vec<String>) {
        let max = self.max_post_chars;

        let full = assemble(title, excerpt, url, &hashtags);
        if full.chars().count() <= max {
            return (full, hashtags);
        }

        let without_tags = assemble(title, excerpt, url, &[]);
        if without_tags.chars().count() <= max {
            return (without_tags, Vec::new());
        }

        let fixed = assemble(title, "", url, &[]).chars().count();
        // room left for the excerpt plus its paragraph separator
        let room = max.saturating_sub(fixed).saturating_sub(2);
        if room >= MIN_EXCERPT_CHARS {
            let shortened = truncate_at_word(excerpt, room);
            let body = assemble(title, &shortened, url, &[]);
            if body.chars().count() <= max {
                return (body, Vec::new());
            }
        }

        let bare = assemble(title, "", url, &[]);
        if bare.chars().count() <= max {
            return (bare, Vec::new());
        }

        (hard_truncate(&bare, max), Vec::new())
    }
}

fn assemble(title: &str, excerpt: &str, url: &str, hashtags: &[String]) -> String {
    let tags = hashtags.join(" ");
    [title, excerpt, url, tags.as_str()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Pick the excerpt: explicit excerpt, else the body's first paragraph, else
/// as many leading sentences as fit, else a word-boundary cut.
pub fn derive_excerpt(content: &dyn Postable, limit: usize) -> String {
    if let Some(explicit) = content.excerpt() {
        let text = collapse_whitespace(&strip_html(explicit));
        if !text.is_empty() {
            return truncate_at_word(&text, limit);
        }
    }

    let text = strip_html(content.body());
    let first = match paragraphs(&text).into_iter().next() {
        Some(p) => p,
        None => return String::new(),
    };

    if first.chars().count() <= limit {
        return first;
    }

    let mut fitted = String::new();
    for sentence in sentences(&first) {
        let candidate = if fitted.is_empty() {
            sentence.to_string()
        } else {
            format!("{} {}", fitted, sentence)
        };
        if candidate.chars().count() > limit {
            break;
        }
        fitted = candidate;
    }

    if fitted.is_empty() {
        truncate_at_word(&first, limit)
    } else {
        fitted
    }
}

/// Turn tags into hashtags.
///
/// Only the first `max` tags are considered. Non-alphanumeric characters are
/// removed, multi-word tags become upper camel case, and tags that end up empty
/// or purely numeric are dropped.
pub fn derive_hashtags(tags: &[String], max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut hashtags = Vec::new();

    for tag in tags.iter().take(max) {
        let words: Vec<&str> = tag
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let joined = match words.len() {
            0 => continue,
            1 => words[0].to_string(),
            _ => words.iter().map(|w| capitalize(w)).collect::<String>(),
        };

        if joined.chars().all(|c| c.is_numeric()) {
            continue;
        }
        if seen.insert(joined.to_lowercase()) {
            hashtags.push(format!("#{}", joined));
        }
    }

    hashtags
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Shorten to at most `max` characters, cutting at a word boundary and
/// appending an ellipsis.
pub fn truncate_at_word(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max <= ELLIPSIS.len() {
        return text.chars().take(max).collect();
    }

    let keep = max - ELLIPSIS.len();
    let prefix: String = text.chars().take(keep).collect();

    // Cut at the last space unless that would throw away more than half
    let cut = match prefix.rfind(char::is_whitespace) {
        Some(idx) if prefix[..idx].chars().count() >= keep / 2 => &prefix[..idx],
        _ => prefix.as_str(),
    };

    let cut = cut.trim_end_matches(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | ':' | '-'));
    format!("{}{}", cut, ELLIPSIS)
}

fn hard_truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max <= ELLIPSIS.len() {
        return text.chars().take(max).collect();
    }
    let mut out: String = text.chars().take(max - ELLIPSIS.len()).collect();
    out.push_str(ELLIPSIS);
    out
}

/// Convert HTML to plain text, keeping paragraph breaks as blank lines
pub fn strip_html(html: &str) -> String {
    let without_scripts = SCRIPT_STYLE.replace_all(html, "");
    let with_breaks = BLOCK_BREAK.replace_all(&without_scripts, "\n\n");
    let without_tags = TAG.replace_all(&with_breaks, "");
    let decoded = decode_entities(&without_tags);

    paragraphs(&decoded).join("\n\n")
}

fn paragraphs(text: &str) -> Vec<String> {
    PARAGRAPH_SPLIT
        .split(text)
        .map(collapse_whitespace)
        .filter(|p| !p.is_empty())
        .collect()
}

fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = match chars.peek() {
                Some((_, next)) => next.is_whitespace(),
                None => true,
            };
            if at_boundary {
                let end = idx + c.len_utf8();
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = end;
            }
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(text: &str) -> String {
    let numeric = NUMERIC_ENTITY.replace_all(text, |caps: &regex::Captures| {
        let code = match (caps.get(1), caps.get(2)) {
            (Some(hex), _) => u32::from_str_radix(hex.as_str(), 16).ok(),
            (_, Some(dec)) => dec.as_str().parse::<u32>().ok(),
            _ => None,
        };
        code.and_then(char::from_u32)
            .map(|c| c.to_string())
            .unwrap_or_default()
    });

    numeric
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&hellip;", "\u{2026}")
        .replace("&mdash;", "\u{2014}")
        .replace("&ndash;", "\u{2013}")
        .replace("&amp;", "&")
}
