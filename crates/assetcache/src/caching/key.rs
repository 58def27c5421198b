use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

/// Identifies an asset: where it comes from, and under which name it is stored on disk.
///
/// The on-disk file name is derived deterministically from the key, so that a later process
/// finds the file again without touching the network. See [`file_name`](Self::file_name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetKey {
    locator: Url,
    identifier: Option<Arc<str>>,
    extension: Option<Arc<str>>,
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.locator)?;
        if let Some(identifier) = &self.identifier {
            write!(f, " ({identifier})")?;
        }
        Ok(())
    }
}

impl From<Url> for AssetKey {
    fn from(locator: Url) -> Self {
        Self::new(locator)
    }
}

impl AssetKey {
    pub fn new(locator: Url) -> Self {
        Self {
            locator,
            identifier: None,
            extension: None,
        }
    }

    pub fn parse(locator: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(locator.parse()?))
    }

    /// Stores the asset under `identifier` instead of a name derived from the locator.
    pub fn with_identifier(mut self, identifier: impl Into<Arc<str>>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Appends `extension` to the file name on disk.
    ///
    /// A leading `.` is ignored.
    pub fn with_extension(mut self, extension: impl AsRef<str>) -> Self {
        let extension = extension.as_ref().trim_start_matches('.');
        self.extension = (!extension.is_empty()).then(|| extension.into());
        self
    }

    pub fn locator(&self) -> &Url {
        &self.locator
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Whether the asset is read straight from the local filesystem.
    pub fn is_local(&self) -> bool {
        self.locator.scheme() == "file"
    }

    /// Returns the name of the file this asset is stored in.
    ///
    /// The name is the identifier if one was given, else the last path segment of the locator,
    /// else a hash of the locator. The explicit extension is appended unless the name already
    /// carries it. Without an explicit extension, a name taken from the identifier inherits the
    /// extension of the locator.
    ///
    /// Distinct locators ending in the same path segment map to the same file. Callers that
    /// mix such locators in one scope need to assign identifiers.
    pub fn file_name(&self) -> String {
        let last_segment = self
            .locator
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty());

        let (base, extension) = match (&self.identifier, last_segment) {
            (Some(identifier), segment) => {
                let inherited = segment.and_then(extension_of);
                (identifier.to_string(), self.extension.as_deref().or(inherited))
            }
            (None, Some(segment)) => (segment.to_owned(), self.extension.as_deref()),
            (None, None) => (hash_hex(self.locator.as_str()), self.extension.as_deref()),
        };

        let mut name = safe_file_name(&base);
        if let Some(extension) = extension {
            let extension = safe_file_name(extension);
            if extension_of(&name) != Some(extension.as_str()) {
                name.push('.');
                name.push_str(&extension);
            }
        }
        name
    }
}

fn extension_of(name: &str) -> Option<&str> {
    match name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() && !extension.is_empty() => Some(extension),
        _ => None,
    }
}

fn hash_hex(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(hash.len() * 2);
    for b in hash {
        hex.write_fmt(format_args!("{b:02x}")).unwrap();
    }
    hex
}

/// Protect against:
/// * ".." and hidden files
/// * path separators
/// * ":" (not a threat on POSIX filesystems, but confuses OS X Finder)
fn safe_file_name(s: &str) -> String {
    let name = s.replace(['/', '\\', ':'], "_");
    if name.is_empty() || name.starts_with('.') {
        format!("_{name}")
    } else {
        name
    }
}
