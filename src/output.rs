use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ListResult, StatusResult};
use crate::coordinator::TaskOutcome;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_outcome(outcome: &TaskOutcome) -> io::Result<()> {
        Self::print_json(outcome)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_list(result: &ListResult) -> io::Result<()> {
        let mut stdout = io::stdout();
        if result.forms.is_empty() {
            writeln!(stdout, "no forms indexed")?;
            return Ok(());
        }
        for form in &result.forms {
            writeln!(
                stdout,
                "{:<32} {:<14} {}  {}",
                form.display_name,
                form.version.to_string(),
                form.last_modified.format("%Y-%m-%d %H:%M"),
                form.form_id
            )?;
        }
        Ok(())
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(stdout, "storage root: {}", result.storage_root)?;
        writeln!(
            stdout,
            "indexed: {} ({} live, {} missing)",
            result.indexed, result.live, result.missing
        )?;
        for task in &result.tasks {
            writeln!(stdout, "task {} #{}: {:?}", task.kind, task.id, task.status)?;
        }
        Ok(())
    }
}
