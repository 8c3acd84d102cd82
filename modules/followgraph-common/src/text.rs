use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

use crate::HarvestError;

/// `@handle` not preceded by a word character, so e-mail addresses don't match.
static RE_HANDLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^A-Za-z0-9_])@([A-Za-z0-9_]{1,15})").unwrap());

static RE_VALID_HANDLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,15}$").unwrap());

/// Handles tagged in a bio, first occurrence order, case-insensitively deduplicated.
pub fn bio_mentions(bio: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    RE_HANDLE
        .captures_iter(bio)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|h| seen.insert(h.to_lowercase()))
        .collect()
}

/// Strip a leading `@` and check the handle is one the API can address.
/// Handles end up in request paths, so anything else is rejected.
pub fn normalize_handle(raw: &str) -> Result<String, HarvestError> {
    let handle = raw.trim().trim_start_matches('@');
    if RE_VALID_HANDLE.is_match(handle) {
        Ok(handle.to_string())
    } else {
        Err(HarvestError::InvalidHandle(raw.to_string()))
    }
}

/// Parse a numeric account or post id sent as a string.
pub fn parse_id(raw: &str) -> Result<i64, HarvestError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|e| HarvestError::Parse(format!("invalid id {raw:?}: {e}")))
}

/// Parse an API timestamp. Accepts RFC 3339 and bare `YYYY-MM-DD`.
pub fn parse_api_timestamp(raw: &str) -> Result<DateTime<Utc>, HarvestError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| HarvestError::Parse(format!("invalid timestamp {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn bio_mentions_finds_handles() {
        let bio = "PhD student @UofT_CS. Lab: @vision_lab, previously @uoft_cs";
        assert_eq!(bio_mentions(bio), vec!["UofT_CS", "vision_lab"]);
    }

    #[test]
    fn bio_mentions_ignores_email_addresses() {
        assert!(bio_mentions("reach me at me@example.com").is_empty());
    }

    #[test]
    fn bio_mentions_at_start_of_text() {
        assert_eq!(bio_mentions("@alice and me"), vec!["alice"]);
    }

    #[test]
    fn normalize_handle_strips_at_sign() {
        assert_eq!(normalize_handle("@Alice_99").unwrap(), "Alice_99");
        assert_eq!(normalize_handle(" bob ").unwrap(), "bob");
    }

    #[test]
    fn normalize_handle_rejects_path_characters() {
        for raw in ["alice?user.fields=x", "../admin", "a/b", "", "@", "sixteen_chars_xx", "ali ce"] {
            assert!(
                matches!(normalize_handle(raw), Err(HarvestError::InvalidHandle(_))),
                "{raw:?} accepted"
            );
        }
    }

    #[test]
    fn parse_id_rejects_garbage() {
        assert_eq!(parse_id("2244994945").unwrap(), 2244994945);
        assert!(parse_id("12ab").is_err());
    }

    #[test]
    fn timestamps_accept_full_and_date_only() {
        let full = parse_api_timestamp("2013-12-14T04:35:55.000Z").unwrap();
        assert_eq!(full.year(), 2013);
        let day = parse_api_timestamp("2020-02-01").unwrap();
        assert_eq!(day.month(), 2);
        assert!(parse_api_timestamp("yesterday").is_err());
    }
}
