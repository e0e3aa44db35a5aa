//! Cleartext paths and directory identifiers.
//!
//! - [`DirectoryId`]: opaque per-directory token, stored in `dir.c9r` markers
//! - [`VaultPath`]: cleartext path inside the vault, always `/`-separated

use std::fmt;

use relative_path::{Component, RelativePath, RelativePathBuf};

/// Length of a non-root directory id (a hyphenated UUID string).
pub const DIRECTORY_ID_LEN: usize = 36;

/// Opaque directory identifier.
///
/// The root directory's id is the empty string; every other directory gets a
/// random UUID when it is created. The id is used as associated data for the
/// names of the directory's children and, hashed, as its storage location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectoryId(String);

impl DirectoryId {
    /// The root directory (empty string ID).
    #[inline]
    pub fn root() -> Self {
        DirectoryId(String::new())
    }

    /// Wrap a freshly generated id. No validation is done.
    #[inline]
    pub(crate) fn from_raw(id: impl Into<String>) -> Self {
        DirectoryId(id.into())
    }

    /// Parse the contents of a `dir.c9r` marker.
    ///
    /// Only a 36-byte hyphenated UUID is accepted; anything else is treated as
    /// a damaged marker by the caller.
    pub fn parse_marker(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != DIRECTORY_ID_LEN {
            return None;
        }
        let id = std::str::from_utf8(bytes).ok()?;
        uuid::Uuid::try_parse(id).ok()?;
        Some(DirectoryId(id.to_owned()))
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl AsRef<str> for DirectoryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DirectoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Cleartext path within a vault.
///
/// Leading and trailing slashes are ignored and `.`/`..` segments are
/// normalized away, so `"/a/./b/"` and `"a/b"` are the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VaultPath(RelativePathBuf);

impl VaultPath {
    #[inline]
    pub fn root() -> Self {
        VaultPath(RelativePathBuf::new())
    }

    pub fn new(path: impl AsRef<str>) -> Self {
        let s = path.as_ref().trim_start_matches('/');
        VaultPath(RelativePath::new(s).normalize())
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.as_str().is_empty()
    }

    /// Whether normalization left a `..` that points above the vault root.
    pub fn escapes_root(&self) -> bool {
        self.0.components().any(|c| c == Component::ParentDir)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn join(&self, component: impl AsRef<str>) -> Self {
        VaultPath(self.0.join_normalized(component.as_ref()))
    }

    /// Returns `None` for the root path.
    pub fn parent(&self) -> Option<VaultPath> {
        if self.is_root() {
            return None;
        }
        self.0.parent().map(|p| VaultPath(p.to_relative_path_buf()))
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.components().map(|c| c.as_str())
    }

    /// Split into parent directory path and final name. `None` for the root.
    pub fn split(&self) -> Option<(VaultPath, &str)> {
        let parent = self.parent()?;
        let name = self.file_name()?;
        Some((parent, name))
    }

    /// Whether `self` equals `ancestor` or lies below it.
    pub fn starts_with(&self, ancestor: &VaultPath) -> bool {
        ancestor.is_root() || self.0.starts_with(&ancestor.0)
    }
}

impl AsRef<str> for VaultPath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for VaultPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for VaultPath {
    fn from(s: &str) -> Self {
        VaultPath::new(s)
    }
}

impl From<String> for VaultPath {
    fn from(s: String) -> Self {
        VaultPath::new(s)
    }
}
