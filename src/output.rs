use std::io::{self, Write};

use serde::Serialize;

use crate::app::{FileMapSummary, ProgressEvent, ProgressSink, RunResult};
use crate::domain::MirroredFile;
use crate::mirror::MirrorReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_mirror(report: &MirrorReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_verify(files: &[MirroredFile]) -> io::Result<()> {
        Self::print_json(files)
    }

    pub fn print_file_map(summary: &FileMapSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
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
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => {
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message)
            }
            None => tracing::info!("{}", event.message),
        }
    }
}
