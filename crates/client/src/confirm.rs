// crates/client/src/confirm.rs
//! Confirmation prompts for `abort`.

use std::io::{BufRead, Write};

use async_trait::async_trait;
use jobwatch_core::{Confirm, Job};

/// Asks on stderr, reads the answer from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinConfirm;

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, job: &Job) -> bool {
        let prompt = format!("Abort job {} ({})? [y/N] ", job.id, job.method);
        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{prompt}");
            let _ = stderr.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => is_yes(&line),
            Ok(Err(e)) => {
                tracing::warn!("failed to read confirmation: {e}");
                false
            }
            Err(e) => {
                tracing::warn!("confirmation prompt panicked: {e}");
                false
            }
        }
    }
}

/// For `--yes`: the user confirmed on the command line.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreConfirmed;

#[async_trait]
impl Confirm for PreConfirmed {
    async fn confirm(&self, _job: &Job) -> bool {
        true
    }
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
