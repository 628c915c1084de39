use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::debug;

use crate::domain::{AttributeSet, QueryLevel};
use crate::error::Pacs2TarError;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const JAVA_OPTIONS_NOTICE: &str = "Picked up _JAVA_OPTIONS";

/// Query/retrieve operations consumed from the remote archive.
pub trait PacsClient: Send + Sync {
    /// Filter keys with a non-empty value are matching keys, empty ones are return keys.
    fn find(
        &self,
        level: QueryLevel,
        filter: &AttributeSet,
    ) -> Result<Vec<AttributeSet>, Pacs2TarError>;

    /// Retrieves every instance of the study into `destination`.
    fn get(&self, study_uid: &str, destination: &Path) -> Result<(), Pacs2TarError>;
}

#[derive(Debug, Clone)]
pub enum ToolStatus {
    Ready,
    Missing { tool: &'static str },
}

#[derive(Debug)]
enum ToolFailure {
    Spawn(String),
    Exit(String),
    TimedOut,
}

/// `PacsClient` backed by the dcm4che `findscu`/`getscu` command line tools.
#[derive(Clone)]
pub struct Dcm4cheClient {
    findscu: Option<PathBuf>,
    getscu: Option<PathBuf>,
    connection: String,
    options: Vec<String>,
    timeout: Duration,
}

impl Dcm4cheClient {
    pub fn new(connection: impl Into<String>, options: Vec<String>, timeout: Duration) -> Self {
        Self {
            findscu: find_in_path("findscu"),
            getscu: find_in_path("getscu"),
            connection: connection.into(),
            options,
            timeout,
        }
    }

    pub fn tool_status(&self) -> ToolStatus {
        if self.findscu.is_none() {
            return ToolStatus::Missing { tool: "findscu" };
        }
        if self.getscu.is_none() {
            return ToolStatus::Missing { tool: "getscu" };
        }
        ToolStatus::Ready
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "--bind".to_string(),
            "DEFAULT".to_string(),
            "--connect".to_string(),
            self.connection.clone(),
            "--accept-timeout".to_string(),
            "10000".to_string(),
        ];
        args.extend(self.options.iter().cloned());
        args
    }

    fn run_cmd(&self, program: &Path, args: &[String]) -> Result<(), ToolFailure> {
        debug!(program = %program.display(), "running dcm4che tool");
        let mut stderr_sink =
            tempfile::tempfile().map_err(|err| ToolFailure::Spawn(err.to_string()))?;
        let stderr_handle = stderr_sink
            .try_clone()
            .map_err(|err| ToolFailure::Spawn(err.to_string()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_handle))
            .spawn()
            .map_err(|err| ToolFailure::Spawn(err.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ToolFailure::TimedOut);
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => return Err(ToolFailure::Spawn(err.to_string())),
            }
        };

        let mut stderr = String::new();
        stderr_sink
            .seek(SeekFrom::Start(0))
            .and_then(|_| stderr_sink.read_to_string(&mut stderr))
            .map_err(|err| ToolFailure::Spawn(err.to_string()))?;
        let stderr = stderr
            .lines()
            .filter(|line| !line.starts_with(JAVA_OPTIONS_NOTICE))
            .collect::<Vec<_>>()
            .join("\n");

        if status.success() {
            if !stderr.trim().is_empty() {
                debug!(program = %program.display(), stderr = %stderr.trim(), "tool stderr");
            }
            return Ok(());
        }
        let message = if stderr.trim().is_empty() {
            format!("command failed: {} ({status})", program.display())
        } else {
            stderr.trim().to_string()
        };
        Err(ToolFailure::Exit(message))
    }

    fn timeout_error(&self, program: &Path) -> Pacs2TarError {
        Pacs2TarError::RetrievalTimeout {
            command: program.display().to_string(),
            seconds: self.timeout.as_secs(),
        }
    }
}

impl PacsClient for Dcm4cheClient {
    fn find(
        &self,
        level: QueryLevel,
        filter: &AttributeSet,
    ) -> Result<Vec<AttributeSet>, Pacs2TarError> {
        let findscu = self
            .findscu
            .as_ref()
            .ok_or_else(|| Pacs2TarError::MissingTool("findscu".to_string()))?;
        let out_dir = tempfile::Builder::new()
            .prefix("pacs2tar-find")
            .tempdir()
            .map_err(|err| Pacs2TarError::Filesystem(err.to_string()))?;

        let mut args = self.common_args();
        args.push("-L".to_string());
        args.push(level.to_string());
        for (keyword, value) in filter.iter() {
            if value.is_empty() {
                args.push("-r".to_string());
                args.push(keyword.to_string());
            } else {
                args.push("-m".to_string());
                args.push(format!("{keyword}={value}"));
            }
        }
        args.push("--xml".to_string());
        args.push("--indent".to_string());
        args.push("--out-dir".to_string());
        args.push(out_dir.path().to_string_lossy().to_string());

        match self.run_cmd(findscu, &args) {
            Ok(()) => {}
            Err(ToolFailure::TimedOut) => {
                return Err(Pacs2TarError::Query(
                    self.timeout_error(findscu).to_string(),
                ));
            }
            Err(ToolFailure::Spawn(message)) | Err(ToolFailure::Exit(message)) => {
                return Err(Pacs2TarError::Query(message));
            }
        }

        let mut responses = fs::read_dir(out_dir.path())
            .map_err(|err| Pacs2TarError::Query(format!("read findscu output: {err}")))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        responses.sort();

        let mut results = Vec::with_capacity(responses.len());
        for path in responses {
            let xml = fs::read_to_string(&path).map_err(|err| {
                Pacs2TarError::Query(format!("read {}: {err}", path.display()))
            })?;
            let attributes = parse_native_xml(&xml);
            if !attributes.is_empty() {
                results.push(attributes);
            }
        }
        Ok(results)
    }

    fn get(&self, study_uid: &str, destination: &Path) -> Result<(), Pacs2TarError> {
        let getscu = self
            .getscu
            .as_ref()
            .ok_or_else(|| Pacs2TarError::MissingTool("getscu".to_string()))?;
        fs::create_dir_all(destination).map_err(|err| Pacs2TarError::Retrieval {
            uid: study_uid.to_string(),
            message: err.to_string(),
        })?;

        let mut args = self.common_args();
        args.push("-m".to_string());
        args.push(format!("StudyInstanceUID={study_uid}"));
        args.push("--directory".to_string());
        args.push(destination.to_string_lossy().to_string());

        self.run_cmd(getscu, &args).map_err(|failure| match failure {
            ToolFailure::TimedOut => self.timeout_error(getscu),
            ToolFailure::Spawn(message) | ToolFailure::Exit(message) => {
                Pacs2TarError::Retrieval {
                    uid: study_uid.to_string(),
                    message,
                }
            }
        })
    }
}

static ATTRIBUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<DicomAttribute\b([^>]*?)(?:/>|>(.*?)</DicomAttribute>)").unwrap()
});
static KEYWORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"keyword="([^"]*)""#).unwrap());
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"tag="([0-9A-Fa-f]{8})""#).unwrap());
static VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<Value number="\d+">(.*?)</Value>"#).unwrap());
static PERSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<PersonName number="\d+">.*?<Alphabetic>(.*?)</Alphabetic>.*?</PersonName>"#)
        .unwrap()
});
static NAME_PART_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(FamilyName|GivenName|MiddleName|NamePrefix|NameSuffix)>([^<]*)</").unwrap()
});

static ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(/?)Item\b[^>]*?(/?)>").unwrap());
static SEQUENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"vr="SQ""#).unwrap());

/// Parses one dcm4che "native DICOM model" XML document into an attribute set.
///
/// Only top-level attributes are kept, under their keyword and their tag. Sequence
/// attributes and everything nested in their items are dropped; the Find responses and
/// instance dumps this reads are flat for every attribute the pipeline consumes.
pub fn parse_native_xml(xml: &str) -> AttributeSet {
    let flat = strip_sequence_items(xml);
    let mut attributes = AttributeSet::new();
    for capture in ATTRIBUTE_RE.captures_iter(&flat) {
        let header = capture.get(1).map(|m| m.as_str()).unwrap_or_default();
        if SEQUENCE_RE.is_match(header) {
            continue;
        }
        let body = capture.get(2).map(|m| m.as_str()).unwrap_or_default();
        let keyword = KEYWORD_RE
            .captures(header)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .filter(|keyword| !keyword.is_empty());
        let tag = TAG_RE
            .captures(header)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_uppercase());
        if keyword.is_none() && tag.is_none() {
            continue;
        }

        let mut values = VALUE_RE
            .captures_iter(body)
            .filter_map(|c| c.get(1))
            .map(|m| unescape_xml(m.as_str().trim()))
            .collect::<Vec<_>>();
        if values.is_empty() {
            values = PERSON_RE
                .captures_iter(body)
                .filter_map(|c| c.get(1))
                .map(|m| person_name(m.as_str()))
                .collect();
        }
        let value = values.join("\\");
        if let Some(tag) = tag {
            attributes.insert(tag, value.clone());
        }
        if let Some(keyword) = keyword {
            attributes.insert(keyword, value);
        }
    }
    attributes
}

/// Removes the content of every `<Item>`, however deeply nested.
fn strip_sequence_items(xml: &str) -> String {
    let mut flat = String::with_capacity(xml.len());
    let mut depth = 0usize;
    let mut last = 0;
    for capture in ITEM_RE.captures_iter(xml) {
        let Some(whole) = capture.get(0) else {
            continue;
        };
        if depth == 0 {
            flat.push_str(&xml[last..whole.start()]);
        }
        let closing = capture.get(1).is_some_and(|m| !m.as_str().is_empty());
        let self_closing = capture.get(2).is_some_and(|m| !m.as_str().is_empty());
        if closing {
            depth = depth.saturating_sub(1);
        } else if !self_closing {
            depth += 1;
        }
        last = whole.end();
    }
    if depth == 0 {
        flat.push_str(&xml[last..]);
    }
    flat
}

fn person_name(alphabetic: &str) -> String {
    let order = ["FamilyName", "GivenName", "MiddleName", "NamePrefix", "NameSuffix"];
    let mut parts = [""; 5];
    for capture in NAME_PART_RE.captures_iter(alphabetic) {
        if let (Some(name), Some(value)) = (capture.get(1), capture.get(2)) {
            if let Some(index) = order.iter().position(|part| *part == name.as_str()) {
                parts[index] = value.as_str().trim();
            }
        }
    }
    unescape_xml(parts.join("^").trim_end_matches('^'))
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
