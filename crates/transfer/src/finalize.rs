//! Download finalization: merge part files into the destination.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::MergeError;
use crate::types::{Part, PartStatus};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Concatenates the part files of `parts` in index order into
/// `destination` and returns the SHA-256 (hex) of the merged bytes.
///
/// Bytes are written to a staging file next to `destination`. Only when
/// the staged size equals `total_size` is it renamed into place and are
/// the part files deleted. On any error the staging file is removed and
/// the part files are left untouched.
pub fn merge(parts: &[Part], destination: &Path, total_size: u64) -> Result<String, MergeError> {
    let mut ordered: Vec<&Part> = parts.iter().collect();
    ordered.sort_by_key(|p| p.index);
    if let Some(part) = ordered.iter().find(|p| p.status != PartStatus::Done) {
        return Err(MergeError::IncompletePart {
            index: part.index,
            status: part.status,
        });
    }

    let staging = staging_path(destination);
    let digest = match write_staging(&ordered, &staging, total_size) {
        Ok(digest) => digest,
        Err(e) => {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
    };
    if let Err(e) = fs::rename(&staging, destination) {
        let _ = fs::remove_file(&staging);
        return Err(e.into());
    }
    debug!(path = %destination.display(), bytes = total_size, "merged parts");

    for part in &ordered {
        if let Some(path) = &part.temp_location
            && let Err(e) = fs::remove_file(path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                part = part.index,
                path = %path.display(),
                error = %e,
                "failed to delete part file"
            );
        }
    }
    Ok(digest)
}

/// Removes a session's part directory if it is empty or missing.
pub fn remove_part_dir(dir: &Path) {
    match fs::remove_dir(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove part directory"),
    }
}

fn staging_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{name}.merging"))
}

fn write_staging(parts: &[&Part], staging: &Path, total_size: u64) -> Result<String, MergeError> {
    let mut out = BufWriter::new(File::create(staging)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    for part in parts {
        let path = part.temp_location.as_deref().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("part {} has no temp file", part.index),
            )
        })?;
        let mut input = File::open(path)?;
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])?;
        }
    }

    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    let actual = fs::metadata(staging)?.len();
    if actual != total_size {
        return Err(MergeError::VerificationFailed {
            expected: total_size,
            actual,
        });
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan;

    /// Writes `data` split into `part_size` part files and returns Done parts.
    fn staged_parts(dir: &Path, data: &[u8], part_size: u64) -> Vec<Part> {
        let mut parts = plan(data.len() as u64, part_size, 0).unwrap();
        for part in &mut parts {
            let path = dir.join(format!("part-{:05}", part.index));
            fs::write(&path, &data[part.range.start as usize..part.range.end as usize]).unwrap();
            part.status = PartStatus::Done;
            part.transferred_bytes = part.range.len();
            part.temp_location = Some(path);
        }
        parts
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn merge_reproduces_bytes_for_any_part_size() {
        let data = payload(1000);
        for part_size in [1u64, 3, 64, 999, 1000, 4096] {
            let dir = tempfile::tempdir().unwrap();
            let parts = staged_parts(dir.path(), &data, part_size);
            let dest = dir.path().join("out.bin");

            let digest = merge(&parts, &dest, data.len() as u64).unwrap();

            assert_eq!(fs::read(&dest).unwrap(), data, "part_size {part_size}");
            assert_eq!(digest, hex::encode(Sha256::digest(&data)));
        }
    }

    #[test]
    fn merge_orders_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(50);
        let mut parts = staged_parts(dir.path(), &data, 10);
        parts.reverse();
        let dest = dir.path().join("out.bin");

        merge(&parts, &dest, 50).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn merge_deletes_part_files() {
        let dir = tempfile::tempdir().unwrap();
        let part_dir = dir.path().join("parts");
        fs::create_dir(&part_dir).unwrap();
        let parts = staged_parts(&part_dir, &payload(30), 10);

        merge(&parts, &dir.path().join("out.bin"), 30).unwrap();
        assert!(parts.iter().all(|p| !p.temp_location.as_ref().unwrap().exists()));

        remove_part_dir(&part_dir);
        assert!(!part_dir.exists());
        assert!(!dir.path().join(".out.bin.merging").exists());
    }

    #[test]
    fn incomplete_part_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut parts = staged_parts(dir.path(), &payload(30), 10);
        parts[1].status = PartStatus::Pending;
        let dest = dir.path().join("out.bin");

        let err = merge(&parts, &dest, 30).unwrap_err();
        assert!(matches!(
            err,
            MergeError::IncompletePart {
                index: 1,
                status: PartStatus::Pending
            }
        ));
        assert!(!dest.exists());
    }

    #[test]
    fn size_mismatch_keeps_parts_and_discards_output() {
        let dir = tempfile::tempdir().unwrap();
        let parts = staged_parts(dir.path(), &payload(30), 10);
        // Corrupt one part file after it was marked Done.
        fs::write(parts[2].temp_location.as_ref().unwrap(), [0u8; 4]).unwrap();
        let dest = dir.path().join("out.bin");

        let err = merge(&parts, &dest, 30).unwrap_err();
        assert!(matches!(
            err,
            MergeError::VerificationFailed {
                expected: 30,
                actual: 24
            }
        ));
        assert!(!dest.exists());
        assert!(!dir.path().join(".out.bin.merging").exists());
        assert!(parts.iter().all(|p| p.temp_location.as_ref().unwrap().exists()));
    }

    #[test]
    fn failed_rename_discards_staging_and_keeps_parts() {
        let dir = tempfile::tempdir().unwrap();
        let parts = staged_parts(dir.path(), &payload(30), 10);
        // A non-empty directory in the way makes the rename fail.
        let dest = dir.path().join("out.bin");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("occupied"), b"x").unwrap();

        let err = merge(&parts, &dest, 30).unwrap_err();
        assert!(matches!(err, MergeError::Io(_)));
        assert!(!dir.path().join(".out.bin.merging").exists());
        assert!(parts.iter().all(|p| p.temp_location.as_ref().unwrap().exists()));
        assert!(dest.join("occupied").exists());
    }

    #[test]
    fn missing_part_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let parts = staged_parts(dir.path(), &payload(20), 10);
        fs::remove_file(parts[0].temp_location.as_ref().unwrap()).unwrap();

        let err = merge(&parts, &dir.path().join("out.bin"), 20).unwrap_err();
        assert!(matches!(err, MergeError::Io(_)));
    }

    #[test]
    fn empty_object_merges_to_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let parts = staged_parts(dir.path(), &[], 10);
        let dest = dir.path().join("empty.bin");
        merge(&parts, &dest, 0).unwrap();
        assert_eq!(fs::metadata(&dest).unwrap().len(), 0);
    }
}
