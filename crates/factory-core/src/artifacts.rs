//! Artifact files written by the factory.
//!
//! Artifacts live under `<artifacts_root>/run-<run_id>/` and are recorded in
//! SQLite with a SHA-256 checksum.

use crate::types::{Artifact, Id};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("artifact file not found: {0}")]
    NotFound(PathBuf),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// `<artifacts_root>/run-<run_id>/`
pub fn run_dir(artifacts_root: &Path, run_id: &Id) -> PathBuf {
    artifacts_root.join(format!("run-{run_id}"))
}

/// Compute SHA256 checksum of file contents.
pub fn compute_checksum(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(ArtifactError::NotFound(path.to_path_buf()));
    }
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Write `content` into the run directory and return its record.
pub fn write_artifact(
    artifacts_root: &Path,
    run_id: &Id,
    kind: &str,
    filename: &str,
    content: &[u8],
) -> Result<Artifact> {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let checksum = format!("{:x}", hasher.finalize());

    let dir = run_dir(artifacts_root, run_id);
    fs::create_dir_all(&dir)?;
    let path = dir.join(filename);

    let mut file = fs::File::create(&path)?;
    file.write_all(content)?;

    Ok(Artifact {
        id: Id::new(),
        run_id: run_id.clone(),
        kind: kind.to_string(),
        path: path.to_string_lossy().to_string(),
        checksum: Some(checksum),
    })
}

/// Replace characters that are unsafe in file names.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn run_dir_layout() {
        let dir = run_dir(Path::new("/srv/artifacts"), &Id::from_string("abc123"));
        assert_eq!(dir, PathBuf::from("/srv/artifacts/run-abc123"));
    }

    #[test]
    fn write_artifact_records_checksum() {
        let root = TempDir::new().unwrap();
        let run_id = Id::from_string("run-1");

        let artifact =
            write_artifact(root.path(), &run_id, "autofix_report", "report.md", b"hello").unwrap();

        assert_eq!(artifact.kind, "autofix_report");
        assert_eq!(artifact.run_id, run_id);
        assert_eq!(fs::read_to_string(&artifact.path).unwrap(), "hello");
        let on_disk = compute_checksum(Path::new(&artifact.path)).unwrap();
        assert_eq!(artifact.checksum.as_deref(), Some(on_disk.as_str()));
        assert_eq!(
            on_disk,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn checksum_of_missing_file_errors() {
        let root = TempDir::new().unwrap();
        let err = compute_checksum(&root.path().join("nope")).unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }

    #[test]
    fn sanitizes_pr_urls() {
        assert_eq!(
            sanitize_filename("https://github.com/o/r/pull/7"),
            "https___github.com_o_r_pull_7"
        );
    }
}
