//! Tar packing of program directories for upload into containers.

use crate::errors::RuntimeError;
use std::path::{Path, PathBuf};

/// Packs the contents of `dir` (not the directory itself) into an in-memory tar.
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>, RuntimeError> {
    if !dir.is_dir() {
        return Err(RuntimeError::Archive(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .map_err(|e| RuntimeError::Archive(format!("{}: {}", dir.display(), e)))?;
    builder
        .into_inner()
        .map_err(|e| RuntimeError::Archive(e.to_string()))
}

/// Runs [`pack_dir`] on the blocking pool.
pub async fn pack_dir_async(dir: PathBuf) -> Result<Vec<u8>, RuntimeError> {
    tokio::task::spawn_blocking(move || pack_dir(&dir))
        .await
        .map_err(|e| RuntimeError::Archive(format!("archive task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_pack_dir_strips_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), b"print('hi')").unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib").join("util.py"), b"x = 1").unwrap();

        let bytes = pack_dir(dir.path()).unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let mut files = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_path_buf();
            if entry.header().entry_type().is_file() {
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                files.push((path, content));
            }
        }
        files.sort();
        assert_eq!(files.len(), 2);
        assert!(files[0].0.ends_with("lib/util.py"));
        assert!(files[1].0.ends_with("main.py"));
        assert_eq!(files[1].1, "print('hi')");
        assert!(files
            .iter()
            .all(|(path, _)| !path.to_string_lossy().contains(&*dir.path().to_string_lossy())));
    }

    #[test]
    fn test_pack_dir_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pack_dir(&dir.path().join("missing")).is_err());
    }
}
