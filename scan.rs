use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use xxhash_rust::xxh3::xxh3_128;

/// Extensions the `image` build can decode.
const SUPPORTED_EXT: &[&str] = &["jpg", "jpeg", "png"];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXT.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expands the given paths into image files. Directories are walked recursively and
/// filtered by extension; files named explicitly are kept as-is. Order follows the
/// arguments, with each directory's contents sorted by path.
pub fn collect_images(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| is_supported_image(e.path()))
                .map(|e| e.into_path())
                .collect();
            found.sort();
            log::debug!("Found {} images under {}", found.len(), path.display());
            images.extend(found);
        } else if path.is_file() {
            images.push(path.clone());
        } else {
            return Err(Error::Path(format!("{} does not exist", path.display())));
        }
    }
    Ok(images)
}

/// Content-derived photo id: xxh3-128 of the file bytes.
pub fn content_id(path: &Path) -> Result<String> {
    let data = fs::read(path)?;
    Ok(format!("{:x}", xxh3_128(&data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_directories_and_keeps_explicit_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("trip");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("b.JPG"), b"b").unwrap();
        fs::write(dir.path().join("a.png"), b"a").unwrap();
        fs::write(dir.path().join("notes.txt"), b"n").unwrap();
        let explicit = dir.path().join("notes.txt");

        let images = collect_images(&[dir.path().to_path_buf(), explicit.clone()]).unwrap();
        assert_eq!(
            images,
            vec![dir.path().join("a.png"), nested.join("b.JPG"), explicit]
        );
    }

    #[test]
    fn missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.jpg");
        assert!(matches!(collect_images(&[missing]), Err(Error::Path(_))));
    }

    #[test]
    fn content_id_depends_only_on_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("b.jpg");
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();
        assert_eq!(content_id(&a).unwrap(), content_id(&b).unwrap());
        fs::write(&b, b"different").unwrap();
        assert_ne!(content_id(&a).unwrap(), content_id(&b).unwrap());
    }
}
