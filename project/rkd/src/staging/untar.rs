use std::fs;
use std::io::Read;
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::StagingError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpack a tar or tar.gz payload into `dest`, keeping file modes.
pub fn unpack(payload: &[u8], dest: &Path) -> Result<(), StagingError> {
    fs::create_dir_all(dest).map_err(|source| extraction(dest, source))?;
    if payload.starts_with(&GZIP_MAGIC) {
        unpack_archive(Archive::new(GzDecoder::new(payload)), dest)
    } else {
        unpack_archive(Archive::new(payload), dest)
    }
}

fn unpack_archive<R: Read>(mut archive: Archive<R>, dest: &Path) -> Result<(), StagingError> {
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let entries = archive
        .entries()
        .map_err(|source| extraction(dest, source))?;
    for entry in entries {
        let mut entry = entry.map_err(|source| extraction(dest, source))?;
        let path = entry
            .path()
            .map_err(|source| extraction(dest, source))?
            .into_owned();
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(extraction(
                dest,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("entry {} escapes the bundle root", path.display()),
                ),
            ));
        }
        entry
            .unpack_in(dest)
            .map_err(|source| extraction(dest, source))?;
    }
    Ok(())
}

fn extraction(dest: &Path, source: std::io::Error) -> StagingError {
    StagingError::Extraction {
        path: dest.to_path_buf(),
        source,
    }
}
