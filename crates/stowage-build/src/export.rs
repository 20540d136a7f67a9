//! Image export: a gzip-compressed tarball carrying the image manifest and
//! the fully assembled root filesystem.

use std::fs::{self, File};
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use tar::{Builder, Header};
use uuid::Uuid;

use crate::error::{BuildError, BuildResult};
use crate::image::ImageManifest;
use crate::store::ImageStore;

const MANIFEST_ENTRY: &str = "manifest.json";
const ROOTFS_ENTRY: &str = "rootfs";

/// Export `image_id` from the store as a `tar.gz` archive at `output`.
///
/// The archive contains `manifest.json` and the assembled root filesystem
/// under `rootfs/`.
///
/// # Errors
///
/// Returns an error when the image or one of its layers is missing, or when
/// writing the archive fails.
pub fn export_image(store: &ImageStore, image_id: &str, output: &Path) -> BuildResult<()> {
    let manifest = ImageManifest::load(store, image_id)?;

    let staging = store.root().join(format!(".export-{}", Uuid::new_v4()));
    let result = write_archive(store, &manifest, &staging, output);
    let _ = fs::remove_dir_all(&staging);
    result
}

fn write_archive(
    store: &ImageStore,
    manifest: &ImageManifest,
    staging: &Path,
    output: &Path,
) -> BuildResult<()> {
    store.assemble_rootfs(manifest, staging)?;

    let file = File::create(output)
        .map_err(|source| BuildError::io("create_export", output, source))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);

    let rendered = serde_json::to_vec_pretty(manifest)
        .map_err(|source| BuildError::json("serialise_export_manifest", output, source))?;
    let mut header = Header::new_gnu();
    header.set_size(u64::try_from(rendered.len()).unwrap_or(u64::MAX));
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, MANIFEST_ENTRY, rendered.as_slice())
        .map_err(|source| BuildError::io("append_export_manifest", output, source))?;

    builder
        .append_dir_all(ROOTFS_ENTRY, staging)
        .map_err(|source| BuildError::io("append_export_rootfs", output, source))?;

    let encoder = builder
        .into_inner()
        .map_err(|source| BuildError::io("finish_export", output, source))?;
    encoder
        .finish()
        .map_err(|source| BuildError::io("flush_export", output, source))?;
    Ok(())
}
