pub mod http;
pub mod script;
pub mod shell;

use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;

/// Replaces every `{{name}}` placeholder with the matching entry from `params`,
/// leaving unmatched placeholders untouched. Grounded in the orchestrator's own
/// merge-field substitution style (`spec.md` §4.1, §6 "Tool sandbox").
pub fn interpolate(template: &str, params: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if template[i..].starts_with("{{") {
            if let Some(end) = template[i..].find("}}") {
                let name = template[i + 2..i + end].trim();
                if let Some(value) = params.get(name) {
                    out.push_str(value);
                    i += end + 2;
                    continue;
                }
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub enum ToolSpec {
    Http(http::HttpTool),
    Script(script::ScriptTool),
    Shell(shell::ShellTool),
}

/// `allow_shell_tools` gates the `Shell` variant (`pipeline.allowShellTools`,
/// default `false`); `Http` and `Script` are always permitted.
pub async fn run_tool(
    spec: &ToolSpec,
    params: &HashMap<String, String>,
    allow_shell_tools: bool,
    project_root: &std::path::Path,
) -> CoreResult<ToolOutcome> {
    match spec {
        ToolSpec::Http(tool) => tool.invoke(params).await,
        ToolSpec::Script(tool) => tool.invoke_with_timeout(params).await,
        ToolSpec::Shell(tool) => {
            if !allow_shell_tools {
                return Err(CoreError::SandboxViolation(
                    "shell tools are disabled (pipeline.allowShellTools = false)".into(),
                ));
            }
            tool.invoke(params, project_root).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolate_substitutes_known_names_and_leaves_rest() {
        let mut params = HashMap::new();
        params.insert("city".to_string(), "Berlin".to_string());
        let out = interpolate("weather in {{city}} for {{unknown}}", &params);
        assert_eq!(out, "weather in Berlin for {{unknown}}");
    }

    #[test]
    fn interpolate_is_a_noop_without_placeholders() {
        let params = HashMap::new();
        assert_eq!(interpolate("plain text", &params), "plain text");
    }
}
