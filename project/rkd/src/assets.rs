//! Bundles shipped inside the binary.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::StagingError;

mod embedded {
    include!(concat!(env!("OUT_DIR"), "/assets.rs"));
}

/// Names a bundle file on disk to serve instead of the embedded ones.
pub const BUNDLE_FILE_ENV: &str = "RKD_BUNDLE_FILE";

#[derive(Clone)]
pub struct Asset {
    name: String,
    data: Cow<'static, [u8]>,
}

impl Asset {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The name up to its first `.`; `ab12.tar.gz` stages as `ab12`.
    pub fn version_id(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Read-only set of named payloads, in the order they were added.
#[derive(Debug, Clone, Default)]
pub struct Assets {
    entries: Vec<Asset>,
}

impl Assets {
    pub fn embedded() -> Self {
        Self {
            entries: embedded::EMBEDDED
                .iter()
                .map(|&(name, data)| Asset {
                    name: name.to_string(),
                    data: Cow::Borrowed(data),
                })
                .collect(),
        }
    }

    /// Embedded assets, unless [`BUNDLE_FILE_ENV`] points at a bundle on disk.
    pub fn load() -> Result<Self, StagingError> {
        match std::env::var_os(BUNDLE_FILE_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::embedded()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, StagingError> {
        let data = std::fs::read(path).map_err(|e| StagingError::PayloadRead {
            name: path.display().to_string(),
            reason: e.to_string(),
        })?;
        info!("using bundle {}", path.display());
        Ok(Self::from_bundle(data))
    }

    pub fn from_entries<I, N>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, Vec<u8>)>,
        N: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(name, data)| Asset {
                    name: name.into(),
                    data: Cow::Owned(data),
                })
                .collect(),
        }
    }

    /// A single bundle named after its digest.
    pub fn from_bundle(data: Vec<u8>) -> Self {
        Self::from_entries([(bundle_name(&data), data)])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(Asset::name)
    }

    pub fn get(&self, name: &str) -> Option<&Asset> {
        self.entries.iter().find(|a| a.name == name)
    }

    /// The bundle that gets staged.
    pub fn primary(&self) -> Option<&Asset> {
        self.entries.first()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn bundle_name(data: &[u8]) -> String {
    format!("{}.tar.gz", hex::encode(Sha256::digest(data)))
}
