use super::{interpolate, ToolOutcome};
use crate::error::CoreError;
use crate::version_store::validate_path;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ShellTool {
    pub command_template: String,
    pub timeout_ms: u64,
}

impl ShellTool {
    pub fn new(command_template: &str) -> Self {
        Self {
            command_template: command_template.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Runs only under the project sandbox (`spec.md` §6), argv-split via
    /// `shell_words` semantics rather than a host shell, bounded to
    /// `MAX_CAPTURE_BYTES` of stdout/stderr and `timeout_ms` wall clock.
    pub async fn invoke(
        &self,
        params: &HashMap<String, String>,
        project_root: &Path,
    ) -> crate::error::CoreResult<ToolOutcome> {
        let root = validate_path(project_root)?;
        let command_line = interpolate(&self.command_template, params);
        let parts = split_args(&command_line)?;
        let Some((program, args)) = parts.split_first() else {
            return Err(CoreError::ToolError("empty shell command".into()));
        };

        let mut command = Command::new(program);
        command.args(args).current_dir(&root);

        let run = command.output();
        let output = match tokio::time::timeout(Duration::from_millis(self.timeout_ms), run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(CoreError::ToolError(e.to_string())),
            Err(_) => return Err(CoreError::ToolError(format!("shell command timed out after {}ms", self.timeout_ms))),
        };

        let (stdout, stdout_truncated) = cap(&output.stdout);
        let (stderr, stderr_truncated) = cap(&output.stderr);
        Ok(ToolOutcome {
            stdout,
            stderr,
            truncated: stdout_truncated || stderr_truncated,
        })
    }
}

fn cap(bytes: &[u8]) -> (String, bool) {
    if bytes.len() > MAX_CAPTURE_BYTES {
        (String::from_utf8_lossy(&bytes[..MAX_CAPTURE_BYTES]).to_string(), true)
    } else {
        (String::from_utf8_lossy(bytes).to_string(), false)
    }
}

/// Minimal argv splitter: whitespace-separated, with `"..."` quoting. No shell
/// metacharacter handling since the command is never passed through a shell.
fn split_args(input: &str) -> crate::error::CoreResult<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if in_quotes {
        return Err(CoreError::Validation("unterminated quote in shell command".into()));
    }
    if has_token {
        args.push(current);
    }
    Ok(args)
}
