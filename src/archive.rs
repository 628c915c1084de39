use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

use crate::domain::{ImageType, Study};
use crate::error::Pacs2TarError;
use crate::scan::InstanceFile;

/// What to do when the archive name of a study is already taken by another study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Append the StudyInstanceUID hash to the name.
    #[default]
    Disambiguate,
    Fail,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveOptions {
    pub gzip: bool,
    pub skip_derived: bool,
    pub collision: CollisionPolicy,
}

#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub path: PathBuf,
    pub members: usize,
    pub skipped_derived: usize,
}

/// Replaces every character outside `[A-Za-z0-9.-]` with `_`.
pub fn clean_path(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// 32-bit `code * 31 + char` rolling hash as eight upper-case hex digits.
pub fn hashcode(value: &str) -> String {
    let code = value
        .chars()
        .fold(0u32, |code, ch| code.wrapping_mul(31).wrapping_add(ch as u32));
    format!("{code:08X}")
}

/// Archive member name of one instance under the facility sort rule.
///
/// `PI/Project/StudyDate/Patient/StudyID.HASH/SSSS/PATIENT.MOD.DESC.SSSS.IIII.DATE.HASH.dcm`,
/// or `None` when an attribute the rule needs is missing.
pub fn sorted_member_name(file: &InstanceFile) -> Option<String> {
    let attrs = &file.attributes;
    let description = attrs.non_empty("StudyDescription")?;
    let mut pi_project = description
        .split(|ch: char| ch == '^' || ch.is_whitespace())
        .filter(|part| !part.is_empty());
    let pi = clean_path(pi_project.next()?);
    let project = clean_path(pi_project.next()?);
    let study_date = attrs.non_empty("StudyDate")?;
    let patient = attrs
        .non_empty("PatientName")?
        .split('^')
        .next()
        .map(str::trim)
        .filter(|patient| !patient.is_empty())?;
    let study_uid = attrs.non_empty("StudyInstanceUID")?;
    let study_id = attrs.non_empty("StudyID").unwrap_or("NA");
    let series: i64 = first_integer(attrs.non_empty("SeriesNumber")?)?;
    let instance: i64 = first_integer(attrs.non_empty("InstanceNumber")?)?;
    let modality = attrs.non_empty("Modality")?;
    let sop_uid = attrs.non_empty("SOPInstanceUID")?;

    let directory = [
        pi,
        project,
        clean_path(study_date),
        clean_path(patient),
        clean_path(&format!("{study_id}.{}", hashcode(study_uid))),
        clean_path(&format!("{series:04}")),
    ]
    .join("/");
    let file_name = clean_path(&format!(
        "{}.{modality}.{}.{series:04}.{instance:04}.{study_date}.{}.dcm",
        patient.to_uppercase(),
        description.to_uppercase(),
        hashcode(sop_uid),
    ));
    Some(format!("{directory}/{file_name}"))
}

fn first_integer(value: &str) -> Option<i64> {
    value.split('\\').next()?.trim().parse().ok()
}

/// `<PatientName>_<StudyDate>_<StudyDescription>` with unsafe characters collapsed.
pub fn archive_stem(study: &Study) -> String {
    [
        &study.patient_name,
        &study.study_date,
        &study.study_description,
    ]
    .iter()
    .map(|part| sanitize_component(part))
    .collect::<Vec<_>>()
    .join("_")
}

fn sanitize_component(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            ch if ch.is_control() => ' ',
            ch => ch,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join("_");
    if collapsed.is_empty() || collapsed.chars().all(|ch| ch == '.') {
        "NA".to_string()
    } else {
        collapsed
    }
}

/// Path of the `.uid` sidecar naming the study an archive belongs to.
///
/// The sidecar keeps the full archive name, so `X.tar` and `X.tar.gz` never share one.
pub fn sidecar_path(archive: &Path) -> PathBuf {
    let name = archive
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    archive.with_file_name(format!("{name}.uid"))
}

fn archive_owner(archive: &Path) -> Option<String> {
    fs::read_to_string(sidecar_path(archive))
        .ok()
        .map(|content| content.trim().to_string())
}

/// Creates the sidecar of a fresh archive name; fails if any sidecar is already there.
fn claim_sidecar(archive: &Path, uid: &str) -> io::Result<()> {
    let path = sidecar_path(archive);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    let written = file
        .write_all(format!("{uid}\n").as_bytes())
        .and_then(|_| file.sync_all());
    if written.is_err() {
        drop(file);
        release_sidecar(archive);
    }
    written
}

fn release_sidecar(archive: &Path) {
    let path = sidecar_path(archive);
    if let Err(err) = fs::remove_file(&path) {
        warn!(path = %path.display(), error = %err, "failed to remove archive sidecar");
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    output_dir: PathBuf,
    options: ArchiveOptions,
}

impl ArchiveBuilder {
    pub fn new(output_dir: impl Into<PathBuf>, options: ArchiveOptions) -> Self {
        Self {
            output_dir: output_dir.into(),
            options,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn extension(&self) -> &'static str {
        if self.options.gzip { "tar.gz" } else { "tar" }
    }

    /// Picks the archive path for a study. The second value is true when the sidecar at
    /// that path already names this study, so an earlier archive there may be replaced.
    ///
    /// A name is free only when neither the archive nor its sidecar exists.
    pub fn resolve_path(&self, study: &Study) -> Result<(PathBuf, bool), Pacs2TarError> {
        let uid = &study.study_instance_uid;
        let stem = archive_stem(study);
        let mut candidates = vec![self.output_dir.join(format!("{stem}.{}", self.extension()))];
        if self.options.collision == CollisionPolicy::Disambiguate {
            candidates.push(
                self.output_dir
                    .join(format!("{stem}_{}.{}", hashcode(uid), self.extension())),
            );
        }

        for candidate in &candidates {
            if archive_owner(candidate).as_deref() == Some(uid.as_str()) {
                return Ok((candidate.clone(), true));
            }
            if !candidate.exists() && !sidecar_path(candidate).exists() {
                return Ok((candidate.clone(), false));
            }
            debug!(uid = %uid, path = %candidate.display(), "archive name taken");
        }
        Err(Pacs2TarError::ArchiveCollision {
            uid: uid.clone(),
            path: candidates.swap_remove(0),
        })
    }

    /// Packs `files` into the study archive and removes `work_dir`.
    ///
    /// The archive only appears under its final name once fully written, and only after
    /// its sidecar names the owning study.
    pub fn build(
        &self,
        study: &Study,
        files: &[InstanceFile],
        work_dir: TempDir,
    ) -> Result<BuiltArchive, Pacs2TarError> {
        let uid = study.study_instance_uid.as_str();
        let archive_error = |message: String| Pacs2TarError::Archive {
            uid: uid.to_string(),
            message,
        };

        let mut skipped_derived = 0;
        let mut used = HashSet::new();
        let mut members = Vec::with_capacity(files.len());
        for file in files {
            if self.options.skip_derived
                && ImageType::parse(&file.attributes.text("ImageType")).is_derived()
            {
                skipped_derived += 1;
                continue;
            }
            let name = member_name(file, &mut used);
            members.push((file.path.as_path(), name));
        }
        if members.is_empty() {
            return Err(archive_error("no files left to archive".to_string()));
        }

        fs::create_dir_all(&self.output_dir).map_err(|err| archive_error(err.to_string()))?;
        let (path, replace) = self.resolve_path(study)?;
        let mut partial = tempfile::Builder::new()
            .prefix(".pacs2tar-")
            .suffix(".partial")
            .tempfile_in(&self.output_dir)
            .map_err(|err| archive_error(err.to_string()))?;

        let written = if self.options.gzip {
            let encoder = GzEncoder::new(partial.as_file_mut(), Compression::default());
            write_members(encoder, &members)
                .and_then(|encoder| encoder.finish())
                .map(|_| ())
        } else {
            write_members(partial.as_file_mut(), &members).map(|_| ())
        };
        written
            .and_then(|_| partial.as_file().sync_all())
            .map_err(|err| archive_error(err.to_string()))?;

        let collision = |err: io::Error| {
            if err.kind() == io::ErrorKind::AlreadyExists {
                Pacs2TarError::ArchiveCollision {
                    uid: uid.to_string(),
                    path: path.clone(),
                }
            } else {
                archive_error(err.to_string())
            }
        };
        if !replace {
            claim_sidecar(&path, uid).map_err(collision)?;
        }
        if let Err(err) = persist(partial, &path, replace) {
            if !replace {
                release_sidecar(&path);
            }
            return Err(collision(err));
        }

        if let Err(err) = work_dir.close() {
            warn!(uid, error = %err, "failed to remove retrieval directory");
        }
        info!(uid, path = %path.display(), members = members.len(), "archive created");
        Ok(BuiltArchive {
            path,
            members: members.len(),
            skipped_derived,
        })
    }
}

fn member_name(file: &InstanceFile, used: &mut HashSet<String>) -> String {
    if let Some(name) = sorted_member_name(file).filter(|name| !used.contains(name)) {
        used.insert(name.clone());
        return name;
    }
    let original = file
        .path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "instance".to_string());
    let mut name = format!("unsorted/{original}");
    let mut counter = 1;
    while used.contains(&name) {
        name = format!("unsorted/{counter}_{original}");
        counter += 1;
    }
    used.insert(name.clone());
    name
}

fn write_members<W: Write>(writer: W, members: &[(&Path, String)]) -> io::Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.mode(tar::HeaderMode::Deterministic);
    for (source, name) in members {
        builder.append_path_with_name(source, name)?;
    }
    builder.into_inner()
}

fn persist(partial: NamedTempFile, path: &Path, replace: bool) -> io::Result<()> {
    let result = if replace {
        partial.persist(path)
    } else {
        partial.persist_noclobber(path)
    };
    result.map(|_| ()).map_err(|err| err.error)
}
