use sha2::{Digest, Sha256};

/// Derive a stable identifier from canonical content.
///
/// Same input always yields the same id, so re-submitting an identical fact
/// is a no-op rather than a duplicate insert.
pub fn content_id(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical form of display text: whitespace-collapsed and lowercased.
pub fn canonicalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_deterministic() {
        let id = content_id("object|paris");
        assert_eq!(id.len(), 64); // SHA256 = 32 bytes = 64 hex chars

        // Same content should produce same id
        assert_eq!(id, content_id("object|paris"));

        // Different content should produce different id
        assert_ne!(id, content_id("object|london"));
    }

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("  Paris  "), "paris");
        assert_eq!(canonicalize("New\tYork   City"), "new york city");
        assert_eq!(canonicalize("France"), canonicalize("FRANCE"));
    }

    #[test]
    fn test_canonicalize_feeds_stable_ids() {
        assert_eq!(
            content_id(&canonicalize("Paris ")),
            content_id(&canonicalize("  paris"))
        );
    }
}
