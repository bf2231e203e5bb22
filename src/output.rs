use std::io::{self, Write};

use serde::Serialize;

use crate::app::{MaintainResult, ProgressEvent, ProgressSink, SyncResult};
use crate::jobs::CommandOutcome;
use crate::storage::FolderProvisioning;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_maintain(result: &MaintainResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_sync(result: &SyncResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_jobs(result: &CommandOutcome) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_provisioning(result: &FolderProvisioning) -> io::Result<()> {
        Self::print_json(result)
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

/// Progress lines on stderr, leaving stdout to the JSON result.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        let mut stderr = io::stderr().lock();
        let _ = match event.elapsed {
            Some(elapsed) => writeln!(stderr, "{} ({:.2}s)", event.message, elapsed.as_secs_f64()),
            None => writeln!(stderr, "{}", event.message),
        };
    }
}

impl OutputMode {
    pub fn sink(self) -> Box<dyn ProgressSink> {
        match self {
            OutputMode::Interactive => Box::new(StderrProgress),
            OutputMode::NonInteractive => Box::new(JsonOutput),
        }
    }
}
