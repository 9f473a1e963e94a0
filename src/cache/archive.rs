//! Packing cache target directories into blobs and back.

use std::io::Cursor;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::error::{CacheError, CacheResult};

fn archive_error(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Archive { path: path.to_path_buf(), source }
}

/// Pack a directory into a gzip'd tar blob.
pub fn pack_dir(dir: &Path) -> CacheResult<Vec<u8>> {
    if !dir.is_dir() {
        return Err(archive_error(
            dir,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "cache path is not a directory"),
        ));
    }

    let encoder = GzEncoder::new(Vec::new(), Compression::fast());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir).map_err(|e| archive_error(dir, e))?;

    let encoder = builder.into_inner().map_err(|e| archive_error(dir, e))?;
    encoder.finish().map_err(|e| archive_error(dir, e))
}

/// Unpack a blob into `target`, replacing whatever was there.
pub fn unpack_into(bytes: &[u8], target: &Path) -> CacheResult<()> {
    if target.is_dir() {
        std::fs::remove_dir_all(target).map_err(|e| archive_error(target, e))?;
    } else if target.exists() {
        std::fs::remove_file(target).map_err(|e| archive_error(target, e))?;
    }
    std::fs::create_dir_all(target).map_err(|e| archive_error(target, e))?;

    let mut archive = Archive::new(GzDecoder::new(Cursor::new(bytes)));
    archive.set_preserve_mtime(true);
    archive.unpack(target).map_err(|e| archive_error(target, e))
}
