use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::Pacs2TarError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    Zip,
    Tar,
    TarGz,
}

impl BundleKind {
    /// Classifies a retrieved file as a nested bundle by its name.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(BundleKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(BundleKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(BundleKind::Tar)
        } else {
            None
        }
    }
}

pub fn unpack_bundle(kind: BundleKind, path: &Path, target_dir: &Path) -> Result<(), Pacs2TarError> {
    match kind {
        BundleKind::Zip => extract_zip(path, target_dir),
        BundleKind::Tar => {
            let file = open(path)?;
            extract_tar(file, target_dir)
        }
        BundleKind::TarGz => {
            let file = open(path)?;
            extract_tar(GzDecoder::new(file), target_dir)
        }
    }
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), Pacs2TarError> {
    let file = open(zip_path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| Pacs2TarError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| Pacs2TarError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(Pacs2TarError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| Pacs2TarError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| Pacs2TarError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| Pacs2TarError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| Pacs2TarError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// Unpacks a tar stream; `tar::Entry::unpack_in` refuses entries escaping `target_dir`.
pub fn extract_tar<R: io::Read>(reader: R, target_dir: &Path) -> Result<(), Pacs2TarError> {
    fs::create_dir_all(target_dir).map_err(|err| Pacs2TarError::Filesystem(err.to_string()))?;
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|err| Pacs2TarError::Filesystem(err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| Pacs2TarError::Filesystem(err.to_string()))?;
        let unpacked = entry
            .unpack_in(target_dir)
            .map_err(|err| Pacs2TarError::Filesystem(err.to_string()))?;
        if !unpacked {
            return Err(Pacs2TarError::Filesystem(
                "tar entry path traversal detected".to_string(),
            ));
        }
    }
    Ok(())
}

/// Regular files under `root`, sorted by file name at every level.
pub fn sorted_files(root: &Path) -> Result<Vec<PathBuf>, Pacs2TarError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|err| Pacs2TarError::Filesystem(err.to_string()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn open(path: &Path) -> Result<fs::File, Pacs2TarError> {
    fs::File::open(path)
        .map_err(|err| Pacs2TarError::Filesystem(format!("open {}: {err}", path.display())))
}
