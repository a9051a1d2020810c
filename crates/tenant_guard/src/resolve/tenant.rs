// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

static TENANT_ID_PATTERN: LazyLock<Regex> = LazyLock::new(tenant_id_pattern);

/// Version 4 style UUID: version nibble `4`, variant nibble `8`, `9`, `a` or `b`.
#[expect(
    clippy::expect_used,
    reason = "the pattern is a fixed literal exercised by the unit tests, so compiling it cannot fail at runtime"
)]
fn tenant_id_pattern() -> Regex {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-4[0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}\b")
        .expect("tenant id pattern is a valid regex")
}

/// A format-validated tenant identifier.
///
/// Only UUID v4-like values are accepted; legacy numeric or free-form identifiers are
/// rejected. The identifier is kept in its lowercase hyphenated form.
///
/// # Examples
///
/// ```
/// use tenant_guard::resolve::TenantId;
///
/// let id = TenantId::parse("3F6A1E2B-9C3D-4A11-8B2F-1234567890AB").unwrap();
/// assert_eq!(id.to_string(), "3f6a1e2b-9c3d-4a11-8b2f-1234567890ab");
///
/// assert!(TenantId::parse("tenant-42").is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(Uuid);

impl TenantId {
    /// Parses `raw` as a tenant id, ignoring surrounding whitespace.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let found = TENANT_ID_PATTERN.find(raw)?;
        if found.range() != (0..raw.len()) {
            return None;
        }

        Uuid::parse_str(found.as_str()).ok().map(Self)
    }

    /// Returns the first tenant id embedded in a location such as
    /// `/3f6a1e2b-9c3d-4a11-8b2f-1234567890ab/dashboard?tab=1`.
    ///
    /// The path is scanned before the query because it comes first.
    #[must_use]
    pub fn find_in_location(location: &str) -> Option<Self> {
        TENANT_ID_PATTERN
            .find_iter(location)
            .find_map(|found| Uuid::parse_str(found.as_str()).ok().map(Self))
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Error returned when a string is not a valid tenant id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{0}` is not a valid tenant id")]
pub struct InvalidTenantId(String);

impl FromStr for TenantId {
    type Err = InvalidTenantId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidTenantId(s.to_string()))
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvalidTenantId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.to_string()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const ID: &str = "3f6a1e2b-9c3d-4a11-8b2f-1234567890ab";

    #[rstest]
    #[case(ID, true)]
    #[case("  3F6A1E2B-9C3D-4A11-8B2F-1234567890AB ", true)]
    #[case("3f6a1e2b-9c3d-1a11-8b2f-1234567890ab", false)]
    #[case("3f6a1e2b-9c3d-4a11-cb2f-1234567890ab", false)]
    #[case("3f6a1e2b9c3d4a118b2f1234567890ab", false)]
    #[case("x3f6a1e2b-9c3d-4a11-8b2f-1234567890ab", false)]
    #[case("12345", false)]
    #[case("", false)]
    fn parse_accepts_only_v4_like_ids(#[case] raw: &str, #[case] valid: bool) {
        assert_eq!(TenantId::parse(raw).is_some(), valid);
    }

    #[rstest]
    #[case("/3f6a1e2b-9c3d-4a11-8b2f-1234567890ab/dashboard", Some(ID))]
    #[case("/dashboard?tenant=3f6a1e2b-9c3d-4a11-8b2f-1234567890ab", Some(ID))]
    #[case("/legacy-42/dashboard?tenant=12345", None)]
    #[case("/login", None)]
    fn find_in_location(#[case] location: &str, #[case] expected: Option<&str>) {
        let found = TenantId::find_in_location(location).map(|id| id.to_string());
        assert_eq!(found.as_deref(), expected);
    }

    #[test]
    fn pattern_compiles_and_anchors_on_word_boundaries() {
        let pattern = tenant_id_pattern();
        assert!(pattern.is_match(ID));
        assert!(!pattern.is_match(&format!("x{ID}")));
    }

    #[test]
    fn serde_uses_string_form() {
        let id = TenantId::parse(ID).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{ID}\""));

        let back: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<TenantId>("\"legacy-42\"").is_err());
    }
}
