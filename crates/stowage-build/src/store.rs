//! Content-addressed image store layout and layer commits.
//!
//! On-disk layout under the store root:
//!
//! ```text
//! bases/<name>/<tag>/          pre-built base image root filesystems
//! packages/                    package index, `<name>-<version>.pkg`
//! cache/packages/              shared download cache for package archives
//! layers/<digest>/fs/          committed build layers
//! images/<image-id>.json       image manifests
//! builds/<build-id>.json       build progress records
//! containers/                  container records and materialised roots
//! ```
//!
//! Layers are committed through a staging directory and renamed into place,
//! so a crashed build never leaves a partially populated layer behind.

use std::fs;
use std::path::{Path, PathBuf};

use globset::GlobSet;
use sha2::{Digest, Sha256};
use stowage_config::BaseImage;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{BuildError, BuildResult};
use crate::image::ImageManifest;
use crate::manifest::Requirement;

const BASES_DIR: &str = "bases";
const PACKAGES_DIR: &str = "packages";
const PACKAGE_CACHE_DIR: &str = "cache/packages";
const LAYERS_DIR: &str = "layers";
const IMAGES_DIR: &str = "images";
const BUILDS_DIR: &str = "builds";
const CONTAINERS_DIR: &str = "containers";
const LAYER_FS_DIR: &str = "fs";

/// Outcome of a layer commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCommit {
    /// The layer was populated and committed by this call.
    Created,
    /// A layer with the same digest was already present.
    Reused,
}

/// Handle onto the local image store.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    /// Open the store at `root`, creating the layout directories on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns an error if any layout directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> BuildResult<Self> {
        let store = Self { root: root.into() };
        for dir in [
            BASES_DIR,
            PACKAGES_DIR,
            PACKAGE_CACHE_DIR,
            LAYERS_DIR,
            IMAGES_DIR,
            BUILDS_DIR,
            CONTAINERS_DIR,
        ] {
            let path = store.root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|source| BuildError::io("create_store_layout", path, source))?;
        }
        Ok(store)
    }

    /// Store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the root filesystem of `base`.
    #[must_use]
    pub fn base_dir(&self, base: &BaseImage) -> PathBuf {
        self.root.join(BASES_DIR).join(&base.name).join(&base.tag)
    }

    /// Resolve `base` to its root filesystem directory.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::BaseMissing`] when the reference is not present
    /// in the store.
    pub fn resolve_base(&self, base: &BaseImage) -> BuildResult<PathBuf> {
        let dir = self.base_dir(base);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(BuildError::BaseMissing {
                reference: base.reference(),
                searched: self.root.join(BASES_DIR),
            })
        }
    }

    /// Resolve a pinned requirement to its archive in the package index.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::PackageMissing`] when no archive matches the
    /// pin.
    pub fn resolve_package(&self, requirement: &Requirement) -> BuildResult<PathBuf> {
        let index = self.root.join(PACKAGES_DIR);
        let archive = index.join(requirement.archive_name());
        if archive.is_file() {
            Ok(archive)
        } else {
            Err(BuildError::PackageMissing {
                requirement: requirement.to_string(),
                searched: index,
            })
        }
    }

    /// Path of a requirement's archive in the shared download cache.
    #[must_use]
    pub fn cached_package(&self, requirement: &Requirement) -> PathBuf {
        self.root
            .join(PACKAGE_CACHE_DIR)
            .join(requirement.archive_name())
    }

    /// Directory of the layer addressed by `digest`.
    #[must_use]
    pub fn layer_dir(&self, digest: &str) -> PathBuf {
        self.root.join(LAYERS_DIR).join(digest)
    }

    /// Root filesystem directory of the layer addressed by `digest`.
    #[must_use]
    pub fn layer_fs(&self, digest: &str) -> PathBuf {
        self.layer_dir(digest).join(LAYER_FS_DIR)
    }

    /// Whether a committed layer with `digest` exists.
    #[must_use]
    pub fn has_layer(&self, digest: &str) -> bool {
        self.layer_dir(digest).is_dir()
    }

    /// Commit a layer: when `digest` is already present the populate closure
    /// never runs, otherwise the closure fills a staging filesystem that is
    /// renamed into place on success.
    ///
    /// # Errors
    ///
    /// Returns an error if staging fails or the populate closure fails; a
    /// failed commit leaves no trace under `layers/`.
    pub fn commit_layer<F>(&self, digest: &str, populate: F) -> BuildResult<LayerCommit>
    where
        F: FnOnce(&Path) -> BuildResult<()>,
    {
        if self.has_layer(digest) {
            return Ok(LayerCommit::Reused);
        }

        let staging = self
            .root
            .join(LAYERS_DIR)
            .join(format!(".staging-{}-{digest}", Uuid::new_v4()));
        let staging_fs = staging.join(LAYER_FS_DIR);
        fs::create_dir_all(&staging_fs)
            .map_err(|source| BuildError::io("create_layer_staging", &staging_fs, source))?;

        if let Err(error) = populate(&staging_fs) {
            let _ = fs::remove_dir_all(&staging);
            return Err(error);
        }

        let target = self.layer_dir(digest);
        match fs::rename(&staging, &target) {
            Ok(()) => Ok(LayerCommit::Created),
            Err(_) if target.is_dir() => {
                // Lost a commit race; the winner's layer is equivalent.
                let _ = fs::remove_dir_all(&staging);
                Ok(LayerCommit::Reused)
            }
            Err(source) => {
                let _ = fs::remove_dir_all(&staging);
                Err(BuildError::io("commit_layer", target, source))
            }
        }
    }

    /// Path of the image manifest record for `image_id`.
    #[must_use]
    pub fn image_record_path(&self, image_id: &str) -> PathBuf {
        self.root.join(IMAGES_DIR).join(format!("{image_id}.json"))
    }

    /// Path of the build progress record for `build_id`.
    #[must_use]
    pub fn build_record_path(&self, build_id: Uuid) -> PathBuf {
        self.root.join(BUILDS_DIR).join(format!("{build_id}.json"))
    }

    /// Path of the container state record for `container_id`.
    #[must_use]
    pub fn container_record_path(&self, container_id: Uuid) -> PathBuf {
        self.root
            .join(CONTAINERS_DIR)
            .join(format!("{container_id}.json"))
    }

    /// Directory a container's root filesystem is materialised into.
    #[must_use]
    pub fn container_root(&self, container_id: Uuid) -> PathBuf {
        self.root
            .join(CONTAINERS_DIR)
            .join(container_id.to_string())
            .join("root")
    }

    /// Materialise the full root filesystem of an image: the base filesystem
    /// first, then each layer in recorded order.
    ///
    /// # Errors
    ///
    /// Returns an error when the base or any referenced layer is missing, or
    /// when the copy fails.
    pub fn assemble_rootfs(&self, manifest: &ImageManifest, target: &Path) -> BuildResult<()> {
        let base = self.resolve_base(&manifest.base)?;
        fs::create_dir_all(target)
            .map_err(|source| BuildError::io("create_rootfs", target, source))?;
        copy_tree(&base, target, None)?;

        for layer in &manifest.layers {
            let fs_dir = self.layer_fs(&layer.digest);
            if !fs_dir.is_dir() {
                return Err(BuildError::LayerMissing {
                    digest: layer.digest.clone(),
                });
            }
            copy_tree(&fs_dir, target, None)?;
        }
        Ok(())
    }
}

/// Chain a step digest from its parent digest and the step's own inputs.
///
/// The parent digest participates in the hash, so any change in an earlier
/// step invalidates every later layer.
#[must_use]
pub fn chain_digest(parent: Option<&str>, inputs: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    if let Some(parent) = parent {
        hasher.update(parent.as_bytes());
    }
    for input in inputs {
        hasher.update(u64::try_from(input.len()).unwrap_or(u64::MAX).to_be_bytes());
        hasher.update(input);
    }
    hex_digest(hasher.finalize().as_slice())
}

/// Deterministic digest of a directory tree: relative paths and file
/// contents, in sorted order, with excluded paths left out.
///
/// # Errors
///
/// Returns an error if the tree cannot be traversed or a file cannot be
/// read.
pub fn digest_tree(root: &Path, excludes: Option<&GlobSet>) -> BuildResult<String> {
    let mut hasher = Sha256::new();
    for entry in sorted_entries(root)? {
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| BuildError::io("strip_prefix", entry.path(), std::io::Error::other("path outside tree")))?;
        if excludes.is_some_and(|set| set.is_match(relative)) {
            continue;
        }
        if entry.file_type().is_file() {
            let contents = fs::read(entry.path())
                .map_err(|source| BuildError::io("read_tree_file", entry.path(), source))?;
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(u64::try_from(contents.len()).unwrap_or(u64::MAX).to_be_bytes());
            hasher.update(&contents);
        }
    }
    Ok(hex_digest(hasher.finalize().as_slice()))
}

/// Copy the files of `source` into `destination`, skipping paths matched
/// by `excludes` (relative to `source`).
///
/// Directories are created only as parents of copied files. The tree
/// digest covers files alone, so a directory whose contents are all
/// excluded must not surface in the copy either; otherwise layer content
/// would diverge from the layer digest.
///
/// # Errors
///
/// Returns an error if traversal or any copy fails.
pub fn copy_tree(source: &Path, destination: &Path, excludes: Option<&GlobSet>) -> BuildResult<()> {
    for entry in WalkDir::new(source).into_iter().filter_entry(|entry| {
        entry
            .path()
            .strip_prefix(source)
            .map_or(true, |relative| {
                relative.as_os_str().is_empty()
                    || !excludes.is_some_and(|set| set.is_match(relative))
            })
    }) {
        let entry =
            entry.map_err(|source_err| BuildError::Io {
                operation: "walk_tree",
                path: source.to_path_buf(),
                source: std::io::Error::other(source_err),
            })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(source) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative,
            _ => continue,
        };
        let target = destination.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| BuildError::io("create_tree_parent", parent, error))?;
        }
        fs::copy(entry.path(), &target)
            .map_err(|error| BuildError::io("copy_tree_file", target.clone(), error))?;
    }
    Ok(())
}

fn sorted_entries(root: &Path) -> BuildResult<Vec<walkdir::DirEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        entries.push(entry.map_err(|source| BuildError::Io {
            operation: "walk_tree",
            path: root.to_path_buf(),
            source: std::io::Error::other(source),
        })?);
    }
    Ok(entries)
}

fn hex_digest(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut rendered = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(rendered, "{byte:02x}");
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ImageStore) {
        let temp = TempDir::new().expect("tempdir");
        let store = ImageStore::open(temp.path().join("store")).expect("store opens");
        (temp, store)
    }

    #[test]
    fn open_creates_layout() {
        let (_temp, store) = store();
        for dir in ["bases", "packages", "cache/packages", "layers", "images", "builds", "containers"] {
            assert!(store.root().join(dir).is_dir(), "{dir} should exist");
        }
    }

    #[test]
    fn commit_layer_is_idempotent() {
        let (_temp, store) = store();
        let digest = chain_digest(None, &[b"layer"]);

        let first = store
            .commit_layer(&digest, |fs_dir| {
                fs::write(fs_dir.join("artifact"), b"payload")
                    .map_err(|source| BuildError::io("write", fs_dir, source))
            })
            .expect("first commit");
        assert_eq!(first, LayerCommit::Created);
        assert!(store.layer_fs(&digest).join("artifact").is_file());

        let second = store
            .commit_layer(&digest, |_| panic!("populate must not run on reuse"))
            .expect("second commit");
        assert_eq!(second, LayerCommit::Reused);
    }

    #[test]
    fn failed_populate_leaves_no_layer() {
        let (_temp, store) = store();
        let digest = chain_digest(None, &[b"doomed"]);

        let result = store.commit_layer(&digest, |_| {
            Err(BuildError::ManifestMissing {
                path: "requirements.txt".into(),
            })
        });
        assert!(result.is_err());
        assert!(!store.has_layer(&digest));
        let leftovers: Vec<_> = fs::read_dir(store.root().join("layers"))
            .expect("layers dir")
            .collect();
        assert!(leftovers.is_empty(), "staging must be cleaned up");
    }

    #[test]
    fn chain_digest_depends_on_parent_and_inputs() {
        let root = chain_digest(None, &[b"base"]);
        let child = chain_digest(Some(&root), &[b"step"]);
        let sibling = chain_digest(Some(&root), &[b"other"]);
        assert_ne!(child, sibling);
        assert_eq!(child, chain_digest(Some(&root), &[b"step"]));
        assert_ne!(child, chain_digest(None, &[b"step"]));
    }

    #[test]
    fn digest_tree_ignores_excluded_paths() {
        let temp = TempDir::new().expect("tempdir");
        fs::create_dir_all(temp.path().join("pkg/__pycache__")).expect("dirs");
        fs::write(temp.path().join("pkg/mod.py"), b"x = 1\n").expect("file");
        fs::write(temp.path().join("pkg/__pycache__/mod.cpython"), b"junk").expect("file");

        let mut builder = globset::GlobSetBuilder::new();
        builder.add(globset::Glob::new("**/__pycache__/**").expect("glob"));
        let excludes = builder.build().expect("globset");

        let with_junk = digest_tree(temp.path(), Some(&excludes)).expect("digest");
        fs::remove_dir_all(temp.path().join("pkg/__pycache__")).expect("remove");
        let without_junk = digest_tree(temp.path(), Some(&excludes)).expect("digest");
        assert_eq!(with_junk, without_junk);
    }

    #[test]
    fn copy_tree_honours_excludes() {
        let temp = TempDir::new().expect("tempdir");
        let source = temp.path().join("src");
        let dest = temp.path().join("dest");
        fs::create_dir_all(source.join(".git")).expect("dirs");
        fs::write(source.join("main.py"), b"app\n").expect("file");
        fs::write(source.join(".git").join("HEAD"), b"ref\n").expect("file");

        // A content-only pattern matches the files under `.git` but never
        // the directory entry itself; the directory must still not appear
        // in the copy, not even empty.
        let mut builder = globset::GlobSetBuilder::new();
        builder.add(globset::Glob::new("**/.git/**").expect("glob"));
        let excludes = builder.build().expect("globset");

        copy_tree(&source, &dest, Some(&excludes)).expect("copy");
        assert!(dest.join("main.py").is_file());
        assert!(!dest.join(".git").exists());
    }

    #[test]
    fn copy_tree_matches_the_digest_file_scope() {
        let temp = TempDir::new().expect("tempdir");
        let source = temp.path().join("src");
        let dest = temp.path().join("dest");
        fs::create_dir_all(source.join("empty")).expect("dirs");
        fs::create_dir_all(source.join("pkg")).expect("dirs");
        fs::write(source.join("pkg/mod.py"), b"x = 1\n").expect("file");

        copy_tree(&source, &dest, None).expect("copy");
        assert!(dest.join("pkg/mod.py").is_file());
        assert!(!dest.join("empty").exists());
    }
}
