//! URL pattern mapping within one application.
//!
//! | Pattern     | Kind       | Example match          |
//! |-------------|------------|------------------------|
//! | `/a/b`      | exact      | `/a/b`                 |
//! | `/a/*`      | path prefix| `/a`, `/a/x/y`         |
//! | `*.jsp`     | extension  | `/x/index.jsp`         |
//! | `/`         | default    | anything else          |
//!
//! Precedence is exact, then the longest `/`-aligned prefix, then extension
//! (only if no prefix matched), then default.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Errors raised while registering a URL pattern.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("invalid url pattern {0:?}")]
    InvalidPattern(String),

    #[error("url pattern {pattern:?} is already mapped to {existing:?}")]
    Conflict { pattern: String, existing: String },
}

/// How a path matched its mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Prefix,
    Extension,
    Default,
}

/// A parsed URL pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UrlPattern {
    Exact(String),
    /// Literal prefix without the trailing `/*`; empty for `/*`.
    Prefix(String),
    /// Extension without the leading `*.`.
    Extension(String),
    Default,
}

impl UrlPattern {
    /// Parses a pattern string.
    ///
    /// The empty string maps the application root and is treated as the exact
    /// pattern `/`.
    ///
    /// # Errors
    ///
    /// [`MappingError::InvalidPattern`] for anything that is not one of the
    /// four pattern shapes.
    pub fn parse(pattern: &str) -> Result<Self, MappingError> {
        let invalid = || MappingError::InvalidPattern(pattern.to_owned());
        if pattern.is_empty() {
            return Ok(Self::Exact("/".to_owned()));
        }
        if pattern == "/" {
            return Ok(Self::Default);
        }
        if let Some(ext) = pattern.strip_prefix("*.") {
            if ext.is_empty() || ext.contains('/') || ext.contains('*') {
                return Err(invalid());
            }
            return Ok(Self::Extension(ext.to_owned()));
        }
        if !pattern.starts_with('/') {
            return Err(invalid());
        }
        if let Some(prefix) = pattern.strip_suffix("/*") {
            if prefix.contains('*') {
                return Err(invalid());
            }
            return Ok(Self::Prefix(prefix.to_owned()));
        }
        if pattern.contains('*') {
            return Err(invalid());
        }
        Ok(Self::Exact(pattern.to_owned()))
    }

    /// Returns `true` if `path` matches this pattern on its own, ignoring precedence.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(p) => p == path,
            Self::Prefix(prefix) => prefix_matches(prefix, path),
            Self::Extension(ext) => extension_of(path) == Some(ext.as_str()),
            Self::Default => true,
        }
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(p) => f.write_str(p),
            Self::Prefix(p) => write!(f, "{p}/*"),
            Self::Extension(e) => write!(f, "*.{e}"),
            Self::Default => f.write_str("/"),
        }
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

// Extension of the final path segment, if it has one.
fn extension_of(path: &str) -> Option<&str> {
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    Some(ext)
}

/// Result of mapping a context-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingMatch {
    pub servlet_name: String,
    pub kind: MatchKind,
    pub pattern: UrlPattern,
    pub servlet_path: String,
    pub path_info: Option<String>,
}

/// Mapping table from URL patterns to servlet names.
///
/// A pattern maps to at most one servlet. Registering the same pattern for a
/// second, different servlet is rejected; since two distinct prefixes of equal
/// length can never both match one path, this is also the tie-break rule for
/// equal-length prefixes.
///
/// # Examples
///
/// ```
/// use servlette::router::mapping::{MatchKind, UrlMapper};
///
/// let mut mapper = UrlMapper::new();
/// mapper.add("/snoop/*", "snoop").unwrap();
/// mapper.add("*.jsp", "jsp").unwrap();
///
/// let m = mapper.map("/snoop/index.jsp").unwrap();
/// assert_eq!(m.servlet_name, "snoop");
/// assert_eq!(m.kind, MatchKind::Prefix);
/// assert_eq!(m.servlet_path, "/snoop");
/// assert_eq!(m.path_info.as_deref(), Some("/index.jsp"));
/// ```
#[derive(Debug, Default, Clone)]
pub struct UrlMapper {
    exact: HashMap<String, String>,
    // Sorted longest first.
    prefixes: Vec<(String, String)>,
    extensions: HashMap<String, String>,
    default: Option<String>,
}

impl UrlMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `pattern` to `servlet_name`.
    ///
    /// Re-adding an identical mapping is a no-op.
    ///
    /// # Errors
    ///
    /// - [`MappingError::InvalidPattern`]: unparseable pattern.
    /// - [`MappingError::Conflict`]: pattern already taken by another servlet.
    pub fn add(&mut self, pattern: &str, servlet_name: &str) -> Result<(), MappingError> {
        let parsed = UrlPattern::parse(pattern)?;
        if let Some(existing) = self.lookup(&parsed) {
            if existing == servlet_name {
                return Ok(());
            }
            return Err(MappingError::Conflict {
                pattern: parsed.to_string(),
                existing: existing.to_owned(),
            });
        }
        let name = servlet_name.to_owned();
        match parsed {
            UrlPattern::Exact(p) => {
                self.exact.insert(p, name);
            }
            UrlPattern::Prefix(p) => {
                self.prefixes.push((p, name));
                self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            }
            UrlPattern::Extension(e) => {
                self.extensions.insert(e, name);
            }
            UrlPattern::Default => self.default = Some(name),
        }
        Ok(())
    }

    fn lookup(&self, pattern: &UrlPattern) -> Option<&str> {
        match pattern {
            UrlPattern::Exact(p) => self.exact.get(p).map(String::as_str),
            UrlPattern::Prefix(p) => self
                .prefixes
                .iter()
                .find(|(prefix, _)| prefix == p)
                .map(|(_, name)| name.as_str()),
            UrlPattern::Extension(e) => self.extensions.get(e).map(String::as_str),
            UrlPattern::Default => self.default.as_deref(),
        }
    }

    /// Returns the number of registered patterns.
    pub fn len(&self) -> usize {
        self.exact.len()
            + self.prefixes.len()
            + self.extensions.len()
            + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves a context-relative path to exactly one mapping.
    ///
    /// An empty path is treated as `/`.
    pub fn map(&self, path: &str) -> Option<MappingMatch> {
        let path = if path.is_empty() { "/" } else { path };

        if let Some(name) = self.exact.get(path) {
            return Some(MappingMatch {
                servlet_name: name.clone(),
                kind: MatchKind::Exact,
                pattern: UrlPattern::Exact(path.to_owned()),
                servlet_path: path.to_owned(),
                path_info: None,
            });
        }

        if let Some((prefix, name)) = self
            .prefixes
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
        {
            let rest = &path[prefix.len()..];
            return Some(MappingMatch {
                servlet_name: name.clone(),
                kind: MatchKind::Prefix,
                pattern: UrlPattern::Prefix(prefix.clone()),
                servlet_path: prefix.clone(),
                path_info: (!rest.is_empty()).then(|| rest.to_owned()),
            });
        }

        if let Some(ext) = extension_of(path) {
            if let Some(name) = self.extensions.get(ext) {
                return Some(MappingMatch {
                    servlet_name: name.clone(),
                    kind: MatchKind::Extension,
                    pattern: UrlPattern::Extension(ext.to_owned()),
                    servlet_path: path.to_owned(),
                    path_info: None,
                });
            }
        }

        self.default.as_ref().map(|name| MappingMatch {
            servlet_name: name.clone(),
            kind: MatchKind::Default,
            pattern: UrlPattern::Default,
            servlet_path: path.to_owned(),
            path_info: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> UrlMapper {
        let mut m = UrlMapper::new();
        m.add("/exact", "exact").unwrap();
        m.add("/a/*", "short").unwrap();
        m.add("/a/b/*", "long").unwrap();
        m.add("*.jsp", "jsp").unwrap();
        m.add("/", "default").unwrap();
        m
    }

    fn winner(m: &UrlMapper, path: &str) -> (String, MatchKind) {
        let hit = m.map(path).unwrap();
        (hit.servlet_name, hit.kind)
    }

    // ── UrlPattern::parse ────────────────────────────────────────────────────

    #[test]
    fn parse_shapes() {
        assert_eq!(UrlPattern::parse("/x").unwrap(), UrlPattern::Exact("/x".into()));
        assert_eq!(UrlPattern::parse("/x/*").unwrap(), UrlPattern::Prefix("/x".into()));
        assert_eq!(UrlPattern::parse("/*").unwrap(), UrlPattern::Prefix(String::new()));
        assert_eq!(UrlPattern::parse("*.do").unwrap(), UrlPattern::Extension("do".into()));
        assert_eq!(UrlPattern::parse("/").unwrap(), UrlPattern::Default);
        assert_eq!(UrlPattern::parse("").unwrap(), UrlPattern::Exact("/".into()));
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["x", "*.", "/a*", "/a/*/b", "*.a/b", "**"] {
            assert!(UrlPattern::parse(bad).is_err(), "{bad}");
        }
    }

    // ── precedence ───────────────────────────────────────────────────────────

    #[test]
    fn exact_beats_everything() {
        let mut m = mapper();
        m.add("/a/b/page.jsp", "page").unwrap();
        assert_eq!(winner(&m, "/a/b/page.jsp"), ("page".into(), MatchKind::Exact));
        assert_eq!(winner(&m, "/exact"), ("exact".into(), MatchKind::Exact));
    }

    #[test]
    fn longest_prefix_wins() {
        let m = mapper();
        assert_eq!(winner(&m, "/a/b/c"), ("long".into(), MatchKind::Prefix));
        assert_eq!(winner(&m, "/a/c"), ("short".into(), MatchKind::Prefix));
        assert_eq!(winner(&m, "/a/b"), ("long".into(), MatchKind::Prefix));
    }

    #[test]
    fn prefix_must_align_on_slash() {
        let m = mapper();
        assert_eq!(winner(&m, "/abc"), ("default".into(), MatchKind::Default));
        assert_eq!(winner(&m, "/a/bc"), ("short".into(), MatchKind::Prefix));
    }

    #[test]
    fn prefix_beats_extension() {
        let m = mapper();
        assert_eq!(winner(&m, "/a/index.jsp"), ("short".into(), MatchKind::Prefix));
    }

    #[test]
    fn extension_uses_final_segment() {
        let m = mapper();
        assert_eq!(winner(&m, "/x/index.jsp"), ("jsp".into(), MatchKind::Extension));
        assert_eq!(winner(&m, "/x.jsp/index"), ("default".into(), MatchKind::Default));
    }

    #[test]
    fn default_is_the_fallback() {
        let m = mapper();
        assert_eq!(winner(&m, "/nothing/here"), ("default".into(), MatchKind::Default));
    }

    #[test]
    fn no_default_means_no_match() {
        let mut m = UrlMapper::new();
        m.add("/only", "only").unwrap();
        assert!(m.map("/other").is_none());
    }

    #[test]
    fn path_info_split() {
        let m = mapper();
        let hit = m.map("/a/b/c/d").unwrap();
        assert_eq!(hit.servlet_path, "/a/b");
        assert_eq!(hit.path_info.as_deref(), Some("/c/d"));
        let hit = m.map("/a/b").unwrap();
        assert_eq!(hit.path_info, None);
    }

    #[test]
    fn slash_star_matches_everything_with_empty_servlet_path() {
        let mut m = UrlMapper::new();
        m.add("/*", "all").unwrap();
        let hit = m.map("/x/y").unwrap();
        assert_eq!(hit.servlet_path, "");
        assert_eq!(hit.path_info.as_deref(), Some("/x/y"));
    }

    #[test]
    fn empty_path_maps_as_root() {
        let mut m = UrlMapper::new();
        m.add("", "root").unwrap();
        assert_eq!(m.map("").unwrap().servlet_name, "root");
    }

    // ── registration tie-break ───────────────────────────────────────────────

    #[test]
    fn same_prefix_for_other_servlet_is_rejected() {
        let mut m = UrlMapper::new();
        m.add("/shared/*", "first").unwrap();
        let err = m.add("/shared/*", "second").unwrap_err();
        assert_eq!(
            err,
            MappingError::Conflict {
                pattern: "/shared/*".into(),
                existing: "first".into()
            }
        );
        assert_eq!(m.map("/shared/x").unwrap().servlet_name, "first");
    }

    #[test]
    fn same_mapping_twice_is_idempotent() {
        let mut m = UrlMapper::new();
        m.add("/p/*", "s").unwrap();
        m.add("/p/*", "s").unwrap();
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn pattern_matches_ignores_precedence() {
        assert!(UrlPattern::parse("/*").unwrap().matches("/anything"));
        assert!(UrlPattern::parse("*.css").unwrap().matches("/s/site.css"));
        assert!(!UrlPattern::parse("/a/*").unwrap().matches("/ab"));
    }
}
