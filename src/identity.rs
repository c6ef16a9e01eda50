//! Image and volume identities.
//!
//! An identity is an opaque string such as `web:https://host/frame/1` or
//! `dicomweb:studies/1.2.3/series/4.5.6`. The part before the first `:` is
//! the scheme and selects the loader; the rest is the locator and is only
//! interpreted by that loader. Identities are compared by exact string
//! equality, no normalization is applied.
//!
//! Images and volumes live in separate namespaces: `ImageId::new("x:1")`
//! and `ImageId::volume("x:1")` are different identities, resolved through
//! different loader tables.

use std::fmt;
use std::sync::Arc;

/// Whether an identity names a single image or a whole volume.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    #[default]
    Image,
    Volume,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Image => f.write_str("image"),
            ResourceKind::Volume => f.write_str("volume"),
        }
    }
}

/// Identity of one image or volume resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId {
    kind: ResourceKind,
    raw: Arc<str>,
}

impl ImageId {
    /// An image identity.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self {
            kind: ResourceKind::Image,
            raw: id.into(),
        }
    }

    /// A volume identity.
    pub fn volume(id: impl Into<Arc<str>>) -> Self {
        Self {
            kind: ResourceKind::Volume,
            raw: id.into(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_volume(&self) -> bool {
        self.kind == ResourceKind::Volume
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The scheme prefix, or `None` when the identity has no `:`.
    pub fn scheme(&self) -> Option<&str> {
        self.raw.split_once(':').map(|(scheme, _)| scheme)
    }

    /// Everything after the scheme separator. The whole identity when there
    /// is no scheme.
    pub fn locator(&self) -> &str {
        match self.raw.split_once(':') {
            Some((_, locator)) => locator,
            None => &self.raw,
        }
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ImageId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
