//! `@name` mention extraction.
//!
//! Scans message text for `@name.eth` / `@name.base.eth`, dedupes
//! case-insensitively, and resolves each name to an address. Names that
//! do not resolve are dropped rather than surfaced as errors.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::resolver::UnifiedResolver;

fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)@([a-z0-9](?:[a-z0-9-]*[a-z0-9])?(?:\.base)?\.eth)\b")
            .expect("mention pattern compiles")
    })
}

/// Mentioned names mapped to their resolved addresses, lowercased.
pub async fn extract_subjects(
    text: &str,
    resolver: &UnifiedResolver,
) -> HashMap<String, String> {
    let mut subjects = HashMap::new();
    let mut seen = HashSet::new();
    for captures in mention_regex().captures_iter(text) {
        let name = captures[1].to_ascii_lowercase();
        if !seen.insert(name.clone()) {
            continue;
        }
        match resolver.resolve_name(&name).await {
            Some(address) => {
                subjects.insert(name, address);
            }
            None => tracing::debug!(name, "mentioned name did not resolve"),
        }
    }
    subjects
}
