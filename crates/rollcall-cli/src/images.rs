//! Copying uploaded images into a student's image folder.

use anyhow::{Context, Result};
use rollcall_hw::source::{is_image_file, list_images};
use std::path::{Path, PathBuf};

/// Folder holding a student's enrollment images.
pub fn student_folder(image_dir: &Path, full_name: &str) -> PathBuf {
    image_dir.join(full_name.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Copy `sources` into `folder`, keeping file names. With `replace`, the
/// folder's existing images are removed first. Non-image files are skipped.
pub fn import_images(sources: &[PathBuf], folder: &Path, replace: bool) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(folder)
        .with_context(|| format!("failed to create {}", folder.display()))?;

    if replace {
        for old in list_images(folder)? {
            std::fs::remove_file(&old)
                .with_context(|| format!("failed to remove {}", old.display()))?;
        }
    }

    let mut copied = Vec::new();
    for source in sources {
        if !is_image_file(source) {
            tracing::warn!(path = %source.display(), "not a .jpg/.jpeg/.png file; skipped");
            continue;
        }
        let Some(name) = source.file_name() else {
            continue;
        };
        let dest = folder.join(name);
        std::fs::copy(source, &dest)
            .with_context(|| format!("failed to copy {}", source.display()))?;
        copied.push(dest);
    }
    tracing::debug!(folder = %folder.display(), copied = copied.len(), "images imported");
    Ok(copied)
}
