use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// How an [`ObjectUrl`] path is resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UrlType {
    /// A file on the local file system.
    File,
    /// An object produced into the object database and indexed by url.
    Content,
    /// Like `Content`, but referenced rather than embedded by consumers.
    ContentLink,
    /// An entry resolved through the database asset index only.
    Virtual,
}

impl UrlType {
    /// `Content` and `ContentLink` both live in the object database.
    pub fn is_content(self) -> bool {
        matches!(self, Self::Content | Self::ContentLink)
    }
}

impl fmt::Display for UrlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Content => write!(f, "content"),
            Self::ContentLink => write!(f, "contentlink"),
            Self::Virtual => write!(f, "virtual"),
        }
    }
}

impl std::str::FromStr for UrlType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "content" => Ok(Self::Content),
            "contentlink" => Ok(Self::ContentLink),
            "virtual" => Ok(Self::Virtual),
            other => Err(TypeError::InvalidUrl(format!("unknown url type `{other}`"))),
        }
    }
}

/// A typed location: a command input, a command output or an index key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectUrl {
    pub url_type: UrlType,
    pub path: String,
}

impl ObjectUrl {
    pub fn new(url_type: UrlType, path: impl Into<String>) -> Self {
        Self {
            url_type,
            path: path.into(),
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self::new(UrlType::File, path)
    }

    pub fn content(path: impl Into<String>) -> Self {
        Self::new(UrlType::Content, path)
    }
}

/// Formats as `type:path`, e.g. `content:textures/a.bin`.
impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.url_type, self.path)
    }
}

impl std::str::FromStr for ObjectUrl {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, path) = s
            .split_once(':')
            .ok_or_else(|| TypeError::InvalidUrl(format!("missing url type in `{s}`")))?;
        if path.is_empty() {
            return Err(TypeError::InvalidUrl(format!("empty path in `{s}`")));
        }
        Ok(Self::new(kind.parse()?, path))
    }
}
