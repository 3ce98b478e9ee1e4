//! vigil's path string type.
//!
//! The watching engine stores and compares an enormous number of paths, most
//! of which share long prefixes and get cloned into pending queues, indices
//! and query results. `PathString` is an immutable, reference-counted string
//! with `/` separators, so cloning is a refcount bump and equality is a byte
//! compare. It also carries the split operations the engine needs:
//! basename/dirname, the (lowercased) suffix used by the suffix index, and
//! component-boundary-aware prefix tests.
//!
//! Paths are required to be valid UTF-8. Separators are normalized to `/` on
//! construction and trailing separators are stripped, so `a/b/`, `a\b` and
//! `a/b` all compare equal.

use std::{
    borrow::Borrow,
    fmt,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is non-UTF-8: {0}")]
    InvalidUnicode(String),
    #[error("path is empty")]
    Empty,
}

/// An immutable, cheaply clonable path string with normalized separators.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathString {
    inner: Arc<str>,
}

impl PathString {
    pub fn new(path: impl AsRef<str>) -> Self {
        let raw = path.as_ref();
        if !raw.contains('\\') && !has_trailing_sep(raw) {
            return Self {
                inner: Arc::from(raw),
            };
        }
        let mut normalized = raw.replace('\\', "/");
        while normalized.len() > 1 && normalized.ends_with('/') {
            normalized.pop();
        }
        Self {
            inner: Arc::from(normalized.as_str()),
        }
    }

    pub fn from_std_path(path: &Path) -> Result<Self, PathError> {
        let raw = path
            .to_str()
            .ok_or_else(|| PathError::InvalidUnicode(path.to_string_lossy().into_owned()))?;
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(Self::new(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn as_std_path(&self) -> &Path {
        Path::new(self.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// The final path component.
    pub fn basename(&self) -> &str {
        match self.inner.rfind('/') {
            Some(idx) => &self.inner[idx + 1..],
            None => &self.inner,
        }
    }

    /// Everything before the final separator, or `None` for a bare name or
    /// the filesystem root.
    pub fn dirname(&self) -> Option<PathString> {
        match self.inner.rfind('/') {
            // "/foo" dirnames to "/"
            Some(0) if self.inner.len() > 1 => Some(PathString::new("/")),
            Some(0) | None => None,
            Some(idx) => Some(PathString::new(&self.inner[..idx])),
        }
    }

    /// The lowercased suffix of the basename: the text after the final dot.
    /// Dotless names, bare dotfiles like `.gitignore`, and names ending in
    /// a dot have no suffix.
    pub fn suffix(&self) -> Option<PathString> {
        let base = self.basename();
        let idx = base.rfind('.')?;
        if idx == 0 || idx + 1 == base.len() {
            return None;
        }
        Some(PathString::new(base[idx + 1..].to_ascii_lowercase()))
    }

    /// Append a single component.
    pub fn join(&self, component: &str) -> PathString {
        debug_assert!(!component.is_empty());
        if self.inner.ends_with('/') {
            PathString::new(format!("{}{}", self.inner, component))
        } else {
            PathString::new(format!("{}/{}", self.inner, component))
        }
    }

    /// Concatenate several components onto this path. Empty components are
    /// skipped, so splitting a string on `/` and feeding it back here is
    /// harmless.
    pub fn path_cat<'a>(&self, components: impl IntoIterator<Item = &'a str>) -> PathString {
        let mut out = self.inner.to_string();
        for component in components {
            if component.is_empty() {
                continue;
            }
            if !out.ends_with('/') {
                out.push('/');
            }
            out.push_str(component);
        }
        PathString::new(out)
    }

    /// Component-boundary-aware prefix test: `a/b` is a prefix of `a/b/c`
    /// but not of `a/bc`.
    pub fn starts_with(&self, prefix: &PathString) -> bool {
        let p = prefix.as_str();
        if !self.inner.starts_with(p) {
            return false;
        }
        self.inner.len() == p.len()
            || p.ends_with('/')
            || self.inner.as_bytes()[p.len()] == b'/'
    }

    /// The remainder of this path below `prefix`, without a leading
    /// separator. Returns an empty string when the paths are equal.
    pub fn strip_prefix(&self, prefix: &PathString) -> Option<&str> {
        if !self.starts_with(prefix) {
            return None;
        }
        let mut rest = &self.inner[prefix.len()..];
        if rest.starts_with('/') {
            rest = &rest[1..];
        }
        Some(rest)
    }

    /// An ASCII-lowercased copy, for case-insensitive keying.
    pub fn to_lower(&self) -> PathString {
        if self.inner.bytes().any(|b| b.is_ascii_uppercase()) {
            PathString::new(self.inner.to_ascii_lowercase())
        } else {
            self.clone()
        }
    }
}

fn has_trailing_sep(raw: &str) -> bool {
    raw.len() > 1 && (raw.ends_with('/') || raw.ends_with('\\'))
}

impl fmt::Display for PathString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl fmt::Debug for PathString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl Deref for PathString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Borrow<str> for PathString {
    fn borrow(&self) -> &str {
        &self.inner
    }
}

impl AsRef<Path> for PathString {
    fn as_ref(&self) -> &Path {
        self.as_std_path()
    }
}

impl AsRef<str> for PathString {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl From<&str> for PathString {
    fn from(value: &str) -> Self {
        PathString::new(value)
    }
}

impl From<String> for PathString {
    fn from(value: String) -> Self {
        PathString::new(value)
    }
}

impl From<&PathString> for PathBuf {
    fn from(value: &PathString) -> Self {
        PathBuf::from(value.as_str())
    }
}

impl PartialEq<str> for PathString {
    fn eq(&self, other: &str) -> bool {
        &*self.inner == other
    }
}

impl PartialEq<&str> for PathString {
    fn eq(&self, other: &&str) -> bool {
        &*self.inner == *other
    }
}

impl Serialize for PathString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.inner)
    }
}

impl<'de> Deserialize<'de> for PathString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(PathString::new(raw))
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::PathString;

    #[test_case("/repo/src/main.rs", "main.rs" ; "nested file")]
    #[test_case("main.rs", "main.rs" ; "bare name")]
    #[test_case("/repo", "repo" ; "top level dir")]
    fn test_basename(input: &str, expected: &str) {
        assert_eq!(PathString::new(input).basename(), expected);
    }

    #[test_case("/repo/src/main.rs", Some("/repo/src") ; "nested file")]
    #[test_case("/repo", Some("/") ; "top level")]
    #[test_case("main.rs", None ; "bare name")]
    fn test_dirname(input: &str, expected: Option<&str>) {
        assert_eq!(
            PathString::new(input).dirname().as_deref(),
            expected
        );
    }

    #[test_case("foo.RS", Some("rs") ; "case folded")]
    #[test_case("archive.tar.gz", Some("gz") ; "last dot wins")]
    #[test_case("Makefile", None ; "no dot")]
    #[test_case(".gitignore", None ; "leading dot only")]
    #[test_case("trailing.", None ; "trailing dot")]
    fn test_suffix(input: &str, expected: Option<&str>) {
        assert_eq!(PathString::new(input).suffix().as_deref(), expected);
    }

    #[test]
    fn test_separator_normalization() {
        assert_eq!(PathString::new("a\\b\\c"), PathString::new("a/b/c"));
        assert_eq!(PathString::new("/repo/sub/"), PathString::new("/repo/sub"));
        assert_eq!(PathString::new("/"), PathString::new("/"));
    }

    #[test]
    fn test_prefix_is_component_aware() {
        let root = PathString::new("/repo/a/b");
        assert!(PathString::new("/repo/a/b/c").starts_with(&root));
        assert!(PathString::new("/repo/a/b").starts_with(&root));
        assert!(!PathString::new("/repo/a/bc").starts_with(&root));
        assert!(!PathString::new("/repo/a").starts_with(&root));
    }

    #[test]
    fn test_strip_prefix() {
        let root = PathString::new("/repo");
        let file = PathString::new("/repo/src/lib.rs");
        assert_eq!(file.strip_prefix(&root), Some("src/lib.rs"));
        assert_eq!(root.strip_prefix(&root), Some(""));
        assert_eq!(root.strip_prefix(&file), None);
    }

    #[test]
    fn test_join_and_cat() {
        let root = PathString::new("/repo");
        assert_eq!(root.join("file"), "/repo/file");
        assert_eq!(root.path_cat(["a", "b"]), "/repo/a/b");
        assert_eq!(root.path_cat("a//b".split('/')), "/repo/a/b");
        assert_eq!(PathString::new("/").join("etc"), "/etc");
    }

    #[test]
    fn test_serde_round_trip() {
        let path = PathString::new("/repo/x");
        let json = serde_json::to_string(&path).unwrap();
        let back: PathString = serde_json::from_str(&json).unwrap();
        assert_eq!(path, back);
    }

    #[test]
    fn test_clone_shares_storage() {
        let a = PathString::new("/repo/deep/path");
        let b = a.clone();
        assert!(std::ptr::eq(a.as_str(), b.as_str()));
    }
}
