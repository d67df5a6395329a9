//! Hashtag extraction from message text.

/// Return the hashtags of `text` without the leading `#`, deduplicated, in order of first
/// appearance.
///
/// A hashtag is a `#` followed by one or more letters, digits or `_`. A lone `#` (or one followed
/// by punctuation) is not a tag.
pub fn extract(text: &str) -> Vec<String> {
    let mut tags: Vec<String> = vec![];
    let mut rest = text;
    while let Some(start) = rest.find('#') {
        let candidate = &rest[start + 1..];
        let end = candidate
            .char_indices()
            .find(|(_, c)| !is_tag_char(*c))
            .map_or(candidate.len(), |(index, _)| index);
        let tag = &candidate[..end];
        if !tag.is_empty() && !tags.iter().any(|seen| seen == tag) {
            tags.push(tag.to_string());
        }
        rest = &candidate[end..];
    }
    tags
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_tags() {
        assert_eq!(extract("look #cats and #dogs"), vec!["cats", "dogs"]);
    }

    #[test]
    fn no_tags() {
        assert!(extract("").is_empty());
        assert!(extract("nothing to see").is_empty());
        assert!(extract("# heading, #!, ##").is_empty());
    }

    #[test]
    fn duplicates_keep_first_position() {
        assert_eq!(extract("#b #a #b #a #c"), vec!["b", "a", "c"]);
    }

    #[test]
    fn tag_ends_at_punctuation() {
        assert_eq!(extract("#summer2024! #best_of, #x-y"), vec!["summer2024", "best_of", "x"]);
    }

    #[test]
    fn adjacent_tags_and_unicode() {
        assert_eq!(extract("#один#два #été"), vec!["один", "два", "été"]);
    }
}
