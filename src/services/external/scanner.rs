use super::source::ScanInvoker;
use crate::error::ApiError;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Runs the local nmap binary and captures its XML report from stdout.
pub struct NmapScanner {
    program: String,
    args: Vec<String>,
}

impl NmapScanner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn command_line(&self, host: &str) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.extend(["-oX".to_string(), "-".to_string(), host.to_string()]);
        argv
    }
}

#[async_trait]
impl ScanInvoker for NmapScanner {
    async fn scan(&self, host: &str) -> Result<Vec<u8>, ApiError> {
        if host.is_empty() || host.starts_with('-') || host.contains(char::is_whitespace) {
            return Err(ApiError::Validation(format!("refusing to scan host {:?}", host)));
        }

        tracing::debug!(host, program = %self.program, "starting active scan");

        // dropping the future (timeout, cancelled run) kills the child
        let output = Command::new(&self.program)
            .args(self.command_line(host))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() && output.stdout.is_empty() {
            return Err(ApiError::ExternalService(format!(
                "scan of {} failed ({}): {}",
                host,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::debug!(host, bytes = output.stdout.len(), "active scan finished");
        Ok(output.stdout)
    }
}
