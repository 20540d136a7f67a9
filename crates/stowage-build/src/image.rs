//! Image manifest records persisted under `images/` in the store.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_config::BaseImage;

use crate::error::{BuildError, BuildResult};
use crate::store::ImageStore;

/// A committed build layer referenced by an image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayerRecord {
    /// Build step that produced the layer.
    pub step: String,
    /// Content digest addressing the layer in the store.
    pub digest: String,
}

/// Launch command baked into the image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Server program to invoke.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory the process starts in.
    pub workdir: PathBuf,
    /// Address the launched process binds.
    pub host: IpAddr,
    /// Port the launched process is expected to bind.
    pub port: u16,
}

/// Static image configuration derived from the recipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageConfig {
    /// Working directory inside the image.
    pub workdir: PathBuf,
    /// Port declared as exposed.
    pub exposed_port: u16,
    /// Launch command executed at container start.
    pub launch: LaunchSpec,
}

/// Immutable description of a built image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageManifest {
    /// Image identifier, equal to the digest of the final build step.
    pub id: String,
    /// Base image the layers apply on top of.
    pub base: BaseImage,
    /// Layers in application order.
    pub layers: Vec<LayerRecord>,
    /// Static configuration recorded at build time.
    pub config: ImageConfig,
    /// Timestamp of the build that first produced this image.
    pub created_at: DateTime<Utc>,
}

impl ImageManifest {
    /// Load the manifest for `image_id` from the store.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::ImageMissing`] when no record exists, or an IO
    /// or JSON error when the record cannot be read.
    pub fn load(store: &ImageStore, image_id: &str) -> BuildResult<Self> {
        let path = store.image_record_path(image_id);
        if !path.is_file() {
            return Err(BuildError::ImageMissing {
                image_id: image_id.to_string(),
            });
        }
        Self::read(&path)
    }

    /// Persist the manifest into the store, keyed by its identifier.
    ///
    /// # Errors
    ///
    /// Returns an error when serialisation or the write fails.
    pub fn persist(&self, store: &ImageStore) -> BuildResult<()> {
        let path = store.image_record_path(&self.id);
        let serialised = serde_json::to_string_pretty(self)
            .map_err(|source| BuildError::json("serialise_image", &path, source))?;
        fs::write(&path, serialised)
            .map_err(|source| BuildError::io("persist_image", path, source))
    }

    fn read(path: &Path) -> BuildResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|source| BuildError::io("read_image", path, source))?;
        serde_json::from_str(&raw).map_err(|source| BuildError::json("parse_image", path, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(id: &str) -> ImageManifest {
        ImageManifest {
            id: id.to_string(),
            base: BaseImage {
                name: "python-slim".to_string(),
                tag: "3.11".to_string(),
            },
            layers: vec![LayerRecord {
                step: "stage_manifest".to_string(),
                digest: "abc123".to_string(),
            }],
            config: ImageConfig {
                workdir: "/app".into(),
                exposed_port: 8000,
                launch: LaunchSpec {
                    program: "uvicorn".to_string(),
                    args: vec!["main:app".to_string()],
                    workdir: "/app".into(),
                    host: "127.0.0.1".parse().expect("loopback"),
                    port: 8000,
                },
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn manifest_round_trips_through_store() {
        let temp = TempDir::new().expect("tempdir");
        let store = ImageStore::open(temp.path()).expect("store");
        let manifest = sample("deadbeef");

        manifest.persist(&store).expect("persist");
        let loaded = ImageManifest::load(&store, "deadbeef").expect("load");
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn unknown_image_is_a_distinct_error() {
        let temp = TempDir::new().expect("tempdir");
        let store = ImageStore::open(temp.path()).expect("store");
        let err = ImageManifest::load(&store, "missing").expect_err("should fail");
        assert!(matches!(err, BuildError::ImageMissing { .. }));
    }
}
