use std::{
    os::unix::process::ExitStatusExt,
    process::{Command, Output},
};

use anyhow::{anyhow, Context, Error};
use log::trace;

use crate::crate_private::Sealed;

/// Extension for `std::process::Output` to check the exit status and turn a
/// failure into an error carrying whatever the process printed.
pub trait OutputChecker: Sealed {
    fn is_success(&self) -> bool;

    /// Get stdout
    fn output(&self) -> String;

    /// Get stderr
    fn error_output(&self) -> String;

    /// Produce a string explaining the exit status of the process
    fn explain_exit(&self) -> String;

    /// Get all available output, useful for reporting or debugging
    fn output_report(&self) -> String {
        [("stdout", self.output()), ("stderr", self.error_output())]
            .into_iter()
            .filter(|(_, text)| !text.is_empty())
            .map(|(stream, text)| format!("{stream}:\n{text}\n"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Check if the process exited successfully and return its stdout
    fn check_output(&self) -> Result<String, Error> {
        if self.is_success() {
            return Ok(self.output());
        }

        Err(match self.output_report() {
            report if !report.is_empty() => anyhow!("Process output:\n{report}"),
            _ => anyhow!("(No output was captured)"),
        }
        .context(self.explain_exit()))
    }
}

impl Sealed for Output {}

impl OutputChecker for Output {
    fn is_success(&self) -> bool {
        self.status.success()
    }

    fn output(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into()
    }

    fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into()
    }

    fn explain_exit(&self) -> String {
        if let Some(code) = self.status.code() {
            format!("process exited with status: {code}")
        } else if let Some(signal) = self.status.signal() {
            format!("process was terminated by signal: {signal}")
        } else {
            "process exited with unknown status".into()
        }
    }
}

pub trait RunAndCheck: Sealed {
    /// Run the command and return its stdout if it exited successfully.
    fn output_and_check(&mut self) -> Result<String, Error>;

    fn render_command(&self) -> String;
}

impl Sealed for Command {}

impl RunAndCheck for Command {
    fn output_and_check(&mut self) -> Result<String, Error> {
        let rendered_command = self.render_command();
        trace!("Executing '{rendered_command}'");
        let output = self
            .output()
            .with_context(|| format!("Failed to execute: {rendered_command}"))?;
        trace!(
            "Executed '{rendered_command}': {}. Report:\n{}",
            output.explain_exit(),
            output.output_report(),
        );

        output
            .check_output()
            .with_context(|| format!("Error when running: {rendered_command}"))
    }

    fn render_command(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|arg| arg.to_string_lossy())
            .map(|arg| {
                if arg.contains(' ') {
                    format!("'{arg}'")
                } else {
                    arg.into()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
