//! Content fingerprints for identities that survive renames.
//!
//! Hashing is CPU-bound, so every file is hashed under a `Cpu` slot on the
//! blocking thread pool.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh64::Xxh64;

use crate::admission::AdmissionController;
use crate::error::TransferError;
use crate::monitor::PoolKind;

const READ_BUFFER: usize = 64 * 1024;

/// Hash `path` with xxh64 while holding one CPU slot.
pub async fn fingerprint_file(
    admission: &AdmissionController,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let permit = admission.acquire(PoolKind::Cpu, 1, cancel).await?;
    let owned: PathBuf = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || hash_file(&owned))
        .await
        .map_err(|err| TransferError::Transient(format!("hash task failed: {err}")))??;
    admission.release(permit);
    Ok(digest)
}

fn hash_file(path: &Path) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut hasher = Xxh64::new(0);
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.digest())
}

/// Identity keyed on content alone, so a renamed copy maps to the same one.
pub fn content_identity(digest: u64) -> String {
    format!("{digest:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionSettings;
    use crate::monitor::{DeviceHints, ResourceMonitor};
    use std::io::Write;
    use std::sync::Arc;

    fn admission() -> AdmissionController {
        let host = Arc::new(DeviceHints::new(2, None));
        let monitor = Arc::new(ResourceMonitor::new(host, None, 0.8));
        AdmissionController::new(monitor, AdmissionSettings::default())
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn same_bytes_same_fingerprint() {
        let ctl = admission();
        let token = CancellationToken::new();
        let a = write_temp(b"in the beginning");
        let b = write_temp(b"in the beginning");
        let c = write_temp(b"something else");

        let fa = fingerprint_file(&ctl, a.path(), &token).await.unwrap();
        let fb = fingerprint_file(&ctl, b.path(), &token).await.unwrap();
        let fc = fingerprint_file(&ctl, c.path(), &token).await.unwrap();
        assert_eq!(fa, fb);
        assert_ne!(fa, fc);
        assert_eq!(ctl.pool(PoolKind::Cpu).in_flight(), 0);
    }

    #[tokio::test]
    async fn large_file_hashes_across_buffers() {
        let ctl = admission();
        let data = vec![3u8; READ_BUFFER * 3 + 17];
        let file = write_temp(&data);
        let digest = fingerprint_file(&ctl, file.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(digest, xxhash_rust::xxh64::xxh64(&data, 0));
    }

    #[tokio::test]
    async fn missing_file_releases_slot() {
        let ctl = admission();
        let err = fingerprint_file(&ctl, Path::new("/no/such/file"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Transient(_)));
        assert_eq!(ctl.pool(PoolKind::Cpu).in_flight(), 0);
    }

    #[test]
    fn identity_format() {
        assert_eq!(content_identity(0xabc), "0000000000000abc");
    }

    #[tokio::test]
    async fn renamed_copy_keeps_its_identity() {
        let ctl = admission();
        let token = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("sunday.wav");
        let copy = dir.path().join("sunday-copy.wav");
        std::fs::write(&original, b"service recording").unwrap();
        std::fs::copy(&original, &copy).unwrap();

        let a = content_identity(fingerprint_file(&ctl, &original, &token).await.unwrap());
        let b = content_identity(fingerprint_file(&ctl, &copy, &token).await.unwrap());
        assert_eq!(a, b);
        assert!(crate::resolver::validate_identity(&a).is_ok());
    }
}
