use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::domain::AttributeSet;
use crate::error::Pacs2TarError;
use crate::fs_util::{BundleKind, sorted_files, unpack_bundle};
use crate::reader::AttributeReader;

/// One retrieved instance file and its header attributes.
#[derive(Debug, Clone)]
pub struct InstanceFile {
    pub path: PathBuf,
    pub attributes: AttributeSet,
}

#[derive(Debug, Default)]
pub struct StudyScan {
    pub files: Vec<InstanceFile>,
    /// Files that could not be read or unpacked.
    pub skipped: usize,
}

/// Reads every retrieved file of a study in walk order.
///
/// Nested `.zip`/`.tar`/`.tgz` bundles are unpacked under `unpack_dir` and read after the
/// main tree. `unpack_dir` must not lie inside `retrieved`.
pub fn scan_study<R: AttributeReader + ?Sized>(
    reader: &R,
    retrieved: &Path,
    unpack_dir: &Path,
) -> Result<StudyScan, Pacs2TarError> {
    let mut scan = StudyScan::default();
    let mut bundles = Vec::new();

    for path in sorted_files(retrieved)? {
        match BundleKind::detect(&path) {
            Some(kind) => bundles.push((kind, path)),
            None => scan.read(reader, path),
        }
    }

    for (index, (kind, bundle)) in bundles.into_iter().enumerate() {
        let target = unpack_dir.join(format!("bundle-{index:03}"));
        if let Err(err) = unpack_bundle(kind, &bundle, &target) {
            warn!(path = %bundle.display(), error = %err, "skipping unreadable bundle");
            scan.skipped += 1;
            continue;
        }
        debug!(path = %bundle.display(), "unpacked nested bundle");
        for path in sorted_files(&target)? {
            scan.read(reader, path);
        }
    }

    Ok(scan)
}

impl StudyScan {
    fn read<R: AttributeReader + ?Sized>(&mut self, reader: &R, path: PathBuf) {
        match reader.read_tags(&path) {
            Ok(attributes) => self.files.push(InstanceFile { path, attributes }),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable file");
                self.skipped += 1;
            }
        }
    }
}
