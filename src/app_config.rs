//! Module for application configuration settings.
//!
//! The daemon reads a single TOML file: filesystem tuning knobs at the top
//! level (they share names with the snapshotter's config), a root directory
//! for the on-disk caches, and the list of layers to mount.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use stargz_fs::fs::{self, Descriptor};

fn default_root() -> PathBuf {
    dirs::cache_dir().map_or_else(
        || PathBuf::from("/var/lib/stargz-fs"),
        |dir| dir.join("stargz-fs"),
    )
}

/// One layer to mount at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerMount {
    /// Where to mount the layer.
    pub mountpoint: PathBuf,

    /// Image reference the blob belongs to.
    pub reference: String,

    /// Digest of the layer blob.
    pub digest: String,

    /// Size of the layer blob in bytes.
    pub size: u64,
}

impl LayerMount {
    /// The mount labels equivalent to this entry.
    #[must_use]
    pub fn labels(&self) -> HashMap<String, String> {
        HashMap::from([
            (fs::TARGET_REF_LABEL.to_owned(), self.reference.clone()),
            (fs::TARGET_DIGEST_LABEL.to_owned(), self.digest.clone()),
            (fs::TARGET_SIZE_LABEL.to_owned(), self.size.to_string()),
        ])
    }

    /// Build a mount entry from an annotated descriptor.
    pub fn from_descriptor(
        mountpoint: PathBuf,
        desc: &Descriptor,
    ) -> Result<Self, ConfigError> {
        let reference = desc
            .annotations
            .get(fs::ANNOTATION_REF_NAME)
            .ok_or(ConfigError::MissingReference)?;
        Ok(Self {
            mountpoint,
            reference: reference.clone(),
            digest: desc.digest.clone(),
            size: desc.size,
        })
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for the on-disk chunk caches.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Filesystem tuning knobs, inlined at the top level of the file.
    #[serde(flatten)]
    pub filesystem: fs::Config,

    /// Layers to mount when the daemon starts.
    #[serde(rename = "layer")]
    pub layers: Vec<LayerMount>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("descriptor carries no image reference annotation")]
    MissingReference,

    #[error("layer at index {0} has an empty mountpoint")]
    EmptyMountpoint(usize),
}

impl Config {
    /// Load configuration from `path`, or fall back to defaults when no
    /// file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            info!("no configuration file given, using defaults");
            return Ok(Self {
                root: default_root(),
                ..Self::default()
            });
        };
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Validate the correctness of the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.mountpoint.as_os_str().is_empty() {
                return Err(ConfigError::EmptyMountpoint(i));
            }
        }
        Ok(())
    }
}
