//! Artifact transfer
//!
//! The artifact is checked locally before any connection is opened, then
//! streamed whole to the staging path. There is no resume or checksum step.

use camino::Utf8Path;
use std::time::Instant;

use super::RemoteChannel;
use crate::{Error, Result};

/// Fail with [`Error::ArtifactNotFound`] unless `local_path` is a regular file
pub fn ensure_artifact(local_path: &Utf8Path) -> Result<u64> {
    match std::fs::metadata(local_path) {
        Ok(metadata) if metadata.is_file() => Ok(metadata.len()),
        Ok(_) => Err(Error::artifact_not_found(local_path)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::artifact_not_found(local_path))
        }
        Err(e) => Err(e.into()),
    }
}

/// Upload the artifact at `local_path` to `remote_path` over `channel`
pub fn upload<C: RemoteChannel + ?Sized>(
    channel: &mut C,
    local_path: &Utf8Path,
    remote_path: &str,
) -> Result<u64> {
    let size = ensure_artifact(local_path)?;
    tracing::info!("Uploading {} ({} bytes) to {}", local_path, size, remote_path);

    let started = Instant::now();
    let written = channel.upload(local_path, remote_path)?;

    if written != size {
        return Err(Error::transfer(
            format!(
                "Uploaded {} of {} bytes to {}",
                written, size, remote_path
            ),
            "The artifact changed during upload; rebuild it and re-run",
        ));
    }

    tracing::info!(
        bytes = written,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Upload complete"
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{StepResult, WaitPolicy};
    use camino::Utf8PathBuf;

    #[derive(Default)]
    struct CountingChannel {
        uploads: Vec<(Utf8PathBuf, String)>,
    }

    impl RemoteChannel for CountingChannel {
        fn execute(&mut self, _command: &str, _wait: WaitPolicy) -> Result<StepResult> {
            Ok(StepResult::default())
        }

        fn upload(&mut self, local_path: &Utf8Path, remote_path: &str) -> Result<u64> {
            self.uploads
                .push((local_path.to_owned(), remote_path.to_string()));
            Ok(std::fs::metadata(local_path)?.len())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_ensure_artifact_missing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(temp_dir.path())
            .unwrap()
            .join("release.tar.gz");

        let err = ensure_artifact(&path).unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound { .. }));
    }

    #[test]
    fn test_ensure_artifact_rejects_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(temp_dir.path()).unwrap();

        assert!(matches!(
            ensure_artifact(path),
            Err(Error::ArtifactNotFound { .. })
        ));
    }

    #[test]
    fn test_upload_missing_artifact_never_touches_channel() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(temp_dir.path())
            .unwrap()
            .join("release.tar.gz");
        let mut channel = CountingChannel::default();

        assert!(upload(&mut channel, &path, "/tmp/release.tar.gz").is_err());
        assert!(channel.uploads.is_empty());
    }

    #[test]
    fn test_upload_streams_whole_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(temp_dir.path())
            .unwrap()
            .join("release.tar.gz");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        let mut channel = CountingChannel::default();

        let written = upload(&mut channel, &path, "/tmp/release.tar.gz").unwrap();

        assert_eq!(written, 4096);
        assert_eq!(channel.uploads.len(), 1);
        assert_eq!(channel.uploads[0].1, "/tmp/release.tar.gz");
    }
}
