//! Topic catalogue offered to users when they pick what their daily feed covers.

/// Topics suggested in the picker, in display order.
pub const SUGGESTED_TOPICS: &[&str] = &[
    "Tech",
    "Sports",
    "Weather",
    "Music",
    "Movies",
    "TV Shows",
    "Food",
    "Travel",
    "Books",
    "Science",
    "Gaming",
    "Fashion",
    "Art",
    "Health",
    "Fitness",
    "Finance",
    "Pets",
    "Nature",
    "History",
    "Comedy",
    "Celebrities",
    "Local Events",
];

/// Catalogue entries the user has not picked yet.
pub fn suggested_topics(preferred: &[String]) -> Vec<String> {
    SUGGESTED_TOPICS
        .iter()
        .filter(|t| !preferred.iter().any(|p| p == *t))
        .map(|t| t.to_string())
        .collect()
}

/// Trims entries and drops blanks and repeats, keeping the first occurrence.
pub fn normalize_topics(input: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(input.len());
    for topic in input {
        let topic = topic.trim();
        if topic.is_empty() || out.iter().any(|t| t == topic) {
            continue;
        }
        out.push(topic.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggestions_exclude_preferred() {
        let preferred = vec!["Tech".to_string(), "Comedy".to_string(), "Knitting".to_string()];
        let s = suggested_topics(&preferred);
        assert!(!s.contains(&"Tech".to_string()));
        assert!(!s.contains(&"Comedy".to_string()));
        assert_eq!(s.len(), SUGGESTED_TOPICS.len() - 2);
        assert_eq!(s[0], "Sports");
    }

    #[test]
    fn normalize_drops_blanks_and_duplicates() {
        let input = vec![" Music ".into(), "".into(), "Music".into(), "Pets".into(), "   ".into()];
        assert_eq!(normalize_topics(input), vec!["Music", "Pets"]);
    }
}
