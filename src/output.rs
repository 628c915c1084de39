use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{ProgressEvent, ProgressSink, RunSummary};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress events to the log.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}

pub fn print_summary(summary: &RunSummary) {
    println!("pacs2tar summary");
    println!("  studies found:     {}", summary.discovered);
    println!("  processed:         {}", summary.processed.len());
    println!("  already retrieved: {}", summary.skipped.len());
    println!("  failed:            {}", summary.failed.len());

    for study in &summary.processed {
        match &study.archive {
            Some(archive) => println!(
                "  + {} -> {} ({} rows)",
                study.study_instance_uid, archive, study.rows_written
            ),
            None => println!("  + {} ({} rows)", study.study_instance_uid, study.rows_written),
        }
    }
    for failure in &summary.failed {
        println!(
            "  ! {} [{}] {}",
            failure.study_instance_uid, failure.kind, failure.message
        );
    }
}
