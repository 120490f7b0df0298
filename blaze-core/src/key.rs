//! Namespaced cache keys.
//!
//! Keys are `prefix:sport:type:id:params...`. Segment order matters: it is
//! what prefix listing and prefix invalidation match against.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator between key segments.
pub const KEY_SEPARATOR: char = ':';

/// Placeholder written for a segment the caller left unset, so later
/// segments keep their position.
const PLACEHOLDER: &str = "_";

/// Position of the `type` segment.
const CATEGORY_SEGMENT: usize = 2;

/// A cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already formatted key.
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn builder(prefix: impl AsRef<str>) -> CacheKeyBuilder {
        CacheKeyBuilder::new(prefix)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(KEY_SEPARATOR)
    }

    /// The `type` segment, used as the queryable tier's category column.
    pub fn category(&self) -> Option<&str> {
        category_of(&self.0)
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::raw(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::raw(s)
    }
}

/// Category of a raw key string.
pub fn category_of(key: &str) -> Option<&str> {
    key.split(KEY_SEPARATOR)
        .nth(CATEGORY_SEGMENT)
        .filter(|s| !s.is_empty() && *s != PLACEHOLDER)
}

fn sanitize(segment: &str) -> String {
    let cleaned: String = segment
        .trim()
        .chars()
        .map(|c| {
            if c == KEY_SEPARATOR || c.is_whitespace() {
                '-'
            } else {
                c
            }
        })
        .collect();
    if cleaned.is_empty() {
        PLACEHOLDER.to_string()
    } else {
        cleaned
    }
}

/// Builder for [`CacheKey`].
#[derive(Debug, Clone, Default)]
pub struct CacheKeyBuilder {
    prefix: String,
    sport: Option<String>,
    kind: Option<String>,
    id: Option<String>,
    params: Vec<(String, String)>,
}

impl CacheKeyBuilder {
    pub fn new(prefix: impl AsRef<str>) -> Self {
        Self {
            prefix: sanitize(prefix.as_ref()),
            ..Self::default()
        }
    }

    pub fn sport(mut self, sport: impl AsRef<str>) -> Self {
        self.sport = Some(sanitize(sport.as_ref()));
        self
    }

    /// The data category, e.g. `game`, `standings`, `roster`.
    pub fn kind(mut self, kind: impl AsRef<str>) -> Self {
        self.kind = Some(sanitize(kind.as_ref()));
        self
    }

    pub fn id(mut self, id: impl fmt::Display) -> Self {
        self.id = Some(sanitize(&id.to_string()));
        self
    }

    /// Append a `name=value` parameter. Parameters keep insertion order.
    pub fn param(mut self, name: impl AsRef<str>, value: impl fmt::Display) -> Self {
        self.params
            .push((sanitize(name.as_ref()), sanitize(&value.to_string())));
        self
    }

    /// Prefix covering every key that shares the segments set so far.
    ///
    /// Stops at the first unset segment and always ends with the separator,
    /// so `bsi:ncaaf` never matches `bsi:ncaafw`.
    pub fn build_prefix(&self) -> String {
        let mut out = self.prefix.clone();
        out.push(KEY_SEPARATOR);
        for segment in [&self.sport, &self.kind, &self.id] {
            match segment {
                Some(s) => {
                    out.push_str(s);
                    out.push(KEY_SEPARATOR);
                }
                None => break,
            }
        }
        out
    }

    pub fn build(self) -> CacheKey {
        let mut out = self.prefix;
        for segment in [self.sport, self.kind, self.id] {
            out.push(KEY_SEPARATOR);
            out.push_str(segment.as_deref().unwrap_or(PLACEHOLDER));
        }
        for (name, value) in self.params {
            out.push(KEY_SEPARATOR);
            out.push_str(&name);
            out.push('=');
            out.push_str(&value);
        }
        CacheKey(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_full_key() {
        let key = CacheKey::builder("bsi")
            .sport("ncaaf")
            .kind("game")
            .id(401_520_281)
            .param("week", 3)
            .param("season", 2025)
            .build();
        assert_eq!(key.as_str(), "bsi:ncaaf:game:401520281:week=3:season=2025");
        assert_eq!(key.category(), Some("game"));
    }

    #[test]
    fn test_builder_placeholders_keep_positions() {
        let key = CacheKey::builder("bsi").kind("standings").build();
        assert_eq!(key.as_str(), "bsi:_:standings:_");
        assert_eq!(key.category(), Some("standings"));

        let no_kind = CacheKey::builder("bsi").sport("mlb").build();
        assert_eq!(no_kind.category(), None);
    }

    #[test]
    fn test_segments_are_sanitized() {
        let key = CacheKey::builder("bsi")
            .sport("college football")
            .kind("rank:ing")
            .id("  ")
            .build();
        assert_eq!(key.as_str(), "bsi:college-football:rank-ing:_");
    }

    #[test]
    fn test_build_prefix_stops_at_first_gap() {
        let builder = CacheKey::builder("bsi").sport("ncaab");
        assert_eq!(builder.build_prefix(), "bsi:ncaab:");

        let gap = CacheKey::builder("bsi").kind("game");
        assert_eq!(gap.build_prefix(), "bsi:");

        let key = CacheKey::builder("bsi").sport("ncaab").kind("game").id(7).build();
        assert!(key.has_prefix(&builder.build_prefix()));
        assert!(!CacheKey::raw("bsi:ncaabw:game:7").has_prefix(&builder.build_prefix()));
    }

    #[test]
    fn test_raw_key_category() {
        assert_eq!(category_of("bsi:mlb:roster:stl"), Some("roster"));
        assert_eq!(category_of("game:123"), None);
        assert_eq!(CacheKey::from("game:123").to_string(), "game:123");
    }
}
