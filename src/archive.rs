//! tar.gz snapshots of images and crash sites.
use crate::util::part_path;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::{
    fs::{self, File},
    io,
    path::{Component, Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to compress '{}': {source}", path.display())]
    Compress { path: PathBuf, source: io::Error },
    #[error("failed to unpack '{}': {source}", path.display())]
    Unpack { path: PathBuf, source: io::Error },
    #[error("unexpected member '{member}' in '{}'", path.display())]
    BadMember { path: PathBuf, member: String },
}

/// Compresses the file or directory `src` into `dest` with `src`'s basename as the root member.
pub fn compress(src: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let err = |source| ArchiveError::Compress {
        path: src.to_path_buf(),
        source,
    };
    let name = src
        .file_name()
        .ok_or_else(|| err(io::Error::new(io::ErrorKind::InvalidInput, "no file name")))?;
    let part = part_path(dest);
    let f = File::create(&part).map_err(err)?;
    let mut builder = tar::Builder::new(GzEncoder::new(f, Compression::default()));
    if src.is_dir() {
        builder.append_dir_all(name, src).map_err(err)?;
    } else {
        builder.append_path_with_name(src, name).map_err(err)?;
    }
    builder.into_inner().and_then(|gz| gz.finish()).map_err(err)?;
    fs::rename(&part, dest).map_err(err)
}

/// Unpacks the snapshot in `src` so that its root member lands exactly at `dest`.
pub fn unpack_to(src: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let err = |source| ArchiveError::Unpack {
        path: src.to_path_buf(),
        source,
    };
    let f = File::open(src).map_err(err)?;
    let mut ar = tar::Archive::new(GzDecoder::new(f));
    for entry in ar.entries().map_err(err)? {
        let mut entry = entry.map_err(err)?;
        let member = entry.path().map_err(err)?.into_owned();
        let mut components = member.components();
        components.next(); // archived root name
        let rest = components.as_path();
        if rest.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(ArchiveError::BadMember {
                path: src.to_path_buf(),
                member: member.display().to_string(),
            });
        }
        let target = if rest.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(rest)
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(err)?;
        }
        entry.unpack(&target).map_err(err)?;
    }
    Ok(())
}
