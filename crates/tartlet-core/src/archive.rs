//! Remote archive directory shares.
//!
//! A share whose source is an `http(s)://` URL is materialized before
//! attach: the archive is downloaded, unpacked into an engine-owned
//! temporary directory and shared from there. The directory disappears
//! with the guard on every exit path.

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// An unpacked remote archive; the backing directory is removed on drop.
pub struct FetchedArchive {
    temp: tempfile::TempDir,
}

impl FetchedArchive {
    /// The unpacked content directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp.path()
    }
}

/// Downloads and unpacks `url` (a tarball, gzipped or plain).
pub async fn fetch(url: &str) -> Result<FetchedArchive> {
    info!(url, "fetching directory share archive");
    let response = reqwest::get(url)
        .await
        .map_err(|err| EngineError::internal(format!("fetching {url}: {err}")))?;
    if !response.status().is_success() {
        return Err(EngineError::internal(format!(
            "fetching {url}: HTTP {}",
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|err| EngineError::internal(format!("downloading {url}: {err}")))?;

    let temp = tempfile::Builder::new()
        .prefix("tartlet-share-")
        .tempdir()?;
    let dest = temp.path().to_path_buf();
    tokio::task::spawn_blocking(move || unpack(&bytes, &dest))
        .await
        .map_err(|err| EngineError::internal(format!("unpack task failed: {err}")))??;

    debug!(url, dir = %temp.path().display(), "archive unpacked");
    Ok(FetchedArchive { temp })
}

/// Unpacks a (possibly gzipped) tarball into `dest`.
///
/// `unpack_in` refuses entries escaping the destination, so hostile
/// archives cannot write outside the engine-owned directory.
fn unpack(bytes: &[u8], dest: &Path) -> Result<()> {
    let reader: Box<dyn Read + '_> = if bytes.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(bytes))
    } else {
        Box::new(bytes)
    };
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        entry.unpack_in(dest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn sample_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "sub/hello.txt", &b"hello"[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_unpack_plain_tar() {
        let dest = tempfile::tempdir().unwrap();
        unpack(&sample_tar(), dest.path()).unwrap();
        let content = std::fs::read_to_string(dest.path().join("sub/hello.txt")).unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_unpack_gzipped_tar() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&sample_tar()).unwrap();
        let gz = encoder.finish().unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack(&gz, dest.path()).unwrap();
        assert!(dest.path().join("sub/hello.txt").is_file());
    }

    #[test]
    fn test_unpack_garbage_fails() {
        let dest = tempfile::tempdir().unwrap();
        assert!(unpack(b"not a tarball at all", dest.path()).is_err());
    }
}
