//! Seam over external program invocation.
//!
//! All subprocess spawning in this crate goes through [`CommandRunner`] so
//! tests can substitute a recording fake. The production implementation
//! blocks until the child exits; no timeout is imposed, so a stuck child
//! stalls the calling worker.

use std::process::Command;

use crate::error::{Error, Result};

pub trait CommandRunner: Send + Sync {
    /// Run a program to completion and return its stdout. A spawn failure or
    /// non-zero exit maps to an error carrying the combined output.
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// Runs programs found on `PATH` with `std::process::Command`.
#[derive(Debug, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::Command {
                program: program.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(Error::Command {
                program: program.to_string(),
                message: format!("{}: {}", output.status, combined.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
