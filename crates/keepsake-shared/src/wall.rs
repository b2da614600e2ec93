//! Presentation helpers for the public wall feed.

/// Listing filter value meaning "no category filter".
pub const ALL_CATEGORIES: &str = "All Categories";

const EXCERPT_CHARS: usize = 150;
const MAX_TAGS: usize = 5;

// First match wins.
const CATEGORY_RULES: &[(&[&str], &str)] = &[
    (&["wedding", "love", "relationship"], "Love & Relationships"),
    (&["business", "startup", "career"], "Career & Business"),
    (&["family", "grandma", "heritage"], "Family & Heritage"),
    (&["goal", "resolution", "achieve"], "Goals & Resolutions"),
    (&["travel", "adventure", "trip"], "Travel & Adventure"),
    (&["pandemic", "history", "historical"], "Historical"),
];

const DEFAULT_CATEGORY: &str = "Personal Growth";

const TAG_VOCABULARY: &[&str] = &[
    "love",
    "family",
    "goals",
    "dreams",
    "wedding",
    "business",
    "travel",
    "college",
    "pandemic",
    "memories",
    "hope",
    "future",
    "past",
    "reflection",
    "growth",
    "career",
    "startup",
    "heritage",
    "recipes",
    "adventure",
];

fn haystack(content: &str, title: &str) -> String {
    format!("{content} {title}").to_lowercase()
}

pub fn determine_category(content: &str, title: &str) -> &'static str {
    let text = haystack(content, title);
    CATEGORY_RULES
        .iter()
        .find(|(words, _)| words.iter().any(|w| text.contains(w)))
        .map(|(_, category)| *category)
        .unwrap_or(DEFAULT_CATEGORY)
}

pub fn extract_tags(content: &str, title: &str) -> Vec<String> {
    let text = haystack(content, title);
    TAG_VOCABULARY
        .iter()
        .filter(|tag| text.contains(*tag))
        .take(MAX_TAGS)
        .map(|tag| tag.to_string())
        .collect()
}

/// First 150 characters, with an ellipsis when truncated.
pub fn excerpt(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// `None` and "All Categories" both mean no filtering.
pub fn matches_category(filter: Option<&str>, category: &str) -> bool {
    match filter {
        None => true,
        Some(f) if f.is_empty() || f == ALL_CATEGORIES => true,
        Some(f) => f == category,
    }
}
