// Linkwatch Engine — Link Extraction
// extract_links

use regex::Regex;
use std::sync::OnceLock;

static LINK_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn link_re() -> Option<&'static Regex> {
    LINK_RE.get_or_init(|| Regex::new(r"https?://\S+").ok()).as_ref()
}

/// Return every absolute http(s) URL in `text`, in order of appearance.
///
/// A URL is a maximal run of non-whitespace starting with `http://` or
/// `https://`. Duplicates are kept and nothing is normalized, so
/// trailing punctuation stays attached.
pub fn extract_links(text: &str) -> Vec<String> {
    match link_re() {
        Some(re) => re.find_iter(text).map(|m| m.as_str().to_string()).collect(),
        None => Vec::new(),
    }
}
