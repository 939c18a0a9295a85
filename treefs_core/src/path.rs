//! Absolute paths inside a working tree.

use crate::error::{Error, Result};
use crate::tree::validate_name;
use std::fmt;
use std::str::FromStr;

/// A normalized, absolute, `/`-separated path within a working tree.
///
/// Parsing resolves `.` and `..` lexically and drops empty components, so
/// `"/a//b/./c/.."` and `"/a/b"` are the same path. `..` at the root stays
/// at the root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TreePath {
    components: Vec<String>,
}

impl TreePath {
    /// The root directory, `/`.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse an absolute path string.
    pub fn parse(path: &str) -> Result<Self> {
        if !path.starts_with('/') {
            return Err(Error::invalid_path(path, "path must be absolute"));
        }

        let mut components: Vec<String> = Vec::new();
        for component in path.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    components.pop();
                }
                name => {
                    validate_name(name)
                        .map_err(|e| Error::invalid_path(path, e.to_string()))?;
                    components.push(name.to_string());
                }
            }
        }

        Ok(Self { components })
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Number of components; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// Last component, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    /// Parent directory, or `None` for the root.
    pub fn parent(&self) -> Option<TreePath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }

    /// Append a single validated entry name.
    pub fn join(&self, name: &str) -> Result<TreePath> {
        validate_name(name).map_err(|e| Error::invalid_path(name, e.to_string()))?;
        let mut components = self.components.clone();
        components.push(name.to_string());
        Ok(Self { components })
    }

    /// Whether `self` is `base` or lies underneath it.
    pub fn starts_with(&self, base: &TreePath) -> bool {
        self.components.starts_with(&base.components)
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}

impl FromStr for TreePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
