use std::collections::HashMap;

/// A parsed merge-field fragment (`spec.md` §4.1, §9 design note "String-template
/// merge fields → AST"). Produced by [`tokenize`] and evaluated against a
/// [`MergeContext`].
#[derive(Debug, Clone, PartialEq)]
pub enum MergeField {
    Literal(String),
    Output(String),
    Context(String),
    Transform { name: String, key: Option<String> },
}

/// Scans `input` for `{{userMessage}}`, `{{output:K}}`, `{{context:K}}`, and
/// `{{transform:NAME[:K]}}` placeholders, leaving unknown/malformed tokens
/// literal rather than erroring (`spec.md` §4.1: "Unknown merge fields are left
/// literal").
pub fn tokenize(input: &str) -> Vec<MergeField> {
    let mut fields = Vec::new();
    let mut literal = String::new();
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        literal.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            literal.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let token_body = &after_open[..end];
        match parse_token(token_body) {
            Some(field) => {
                if !literal.is_empty() {
                    fields.push(MergeField::Literal(std::mem::take(&mut literal)));
                }
                fields.push(field);
            }
            None => {
                literal.push_str("{{");
                literal.push_str(token_body);
                literal.push_str("}}");
            }
        }
        rest = &after_open[end + 2..];
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        fields.push(MergeField::Literal(literal));
    }
    fields
}

fn parse_token(body: &str) -> Option<MergeField> {
    if body == "userMessage" {
        return Some(MergeField::Context("userMessage".to_string()));
    }
    if let Some(key) = body.strip_prefix("output:") {
        if key.is_empty() {
            return None;
        }
        return Some(MergeField::Output(key.to_string()));
    }
    if let Some(key) = body.strip_prefix("context:") {
        if key.is_empty() {
            return None;
        }
        return Some(MergeField::Context(key.to_string()));
    }
    if let Some(rest) = body.strip_prefix("transform:") {
        if rest.is_empty() {
            return None;
        }
        return match rest.split_once(':') {
            Some((name, key)) if !name.is_empty() && !key.is_empty() => Some(MergeField::Transform {
                name: name.to_string(),
                key: Some(key.to_string()),
            }),
            Some(_) => None,
            None => Some(MergeField::Transform {
                name: rest.to_string(),
                key: None,
            }),
        };
    }
    None
}

/// An upstream source mapping entry (`spec.md` §4.1): a prior agent's output
/// under an alias, optionally passed through a named transform.
#[derive(Debug, Clone)]
pub struct UpstreamSource {
    pub source_key: String,
    pub alias: Option<String>,
    pub transform: Option<String>,
}

/// Resolved context available to merge-field evaluation for one dispatch step:
/// prior agents' raw outputs keyed by agent name, the user message, and an
/// optional `upstreamSources` filter that replaces the default "all ancestors"
/// view when present (`spec.md` §4.1).
pub struct MergeContext<'a> {
    pub user_message: &'a str,
    pub outputs: &'a HashMap<String, String>,
    pub upstream_sources: Option<&'a [UpstreamSource]>,
}

impl<'a> MergeContext<'a> {
    /// The ancestor-output view a plain `{{output:K}}`/`{{context:K}}` reference
    /// resolves against: `upstreamSources`, when present, replaces rather than
    /// supplements the default "every ancestor" view.
    fn visible_outputs(&self) -> HashMap<String, String> {
        match self.upstream_sources {
            Some(sources) => sources
                .iter()
                .filter_map(|s| {
                    let raw = self.outputs.get(&s.source_key)?;
                    let value = apply_named_transform(s.transform.as_deref(), raw);
                    let key = s.alias.clone().unwrap_or_else(|| s.source_key.clone());
                    Some((key, value))
                })
                .collect(),
            None => self.outputs.clone(),
        }
    }

    fn resolve_field(&self, field: &MergeField) -> String {
        match field {
            MergeField::Literal(text) => text.clone(),
            MergeField::Output(key) if key == "userMessage" => self.user_message.to_string(),
            MergeField::Output(key) => self.visible_outputs().get(key).cloned().unwrap_or_default(),
            MergeField::Context(key) if key == "userMessage" => self.user_message.to_string(),
            MergeField::Context(key) => self.visible_outputs().get(key).cloned().unwrap_or_default(),
            MergeField::Transform { name, key } => self.resolve_transform(name, key.as_deref()),
        }
    }

    fn resolve_transform(&self, name: &str, key: Option<&str>) -> String {
        match name {
            "design-system" => {
                let source_key = key.unwrap_or("architect");
                let raw = self.outputs.get(source_key).cloned().unwrap_or_default();
                render_design_system(&raw)
            }
            "file-manifest" => {
                let source_key = key.unwrap_or_else(|| most_recent_dev_agent(self.outputs));
                let raw = self.outputs.get(source_key).cloned().unwrap_or_default();
                render_file_manifest(&raw)
            }
            "project-source" => {
                // Resolved by the caller via `MergeContext::project_source_text`
                // (requires filesystem access this module deliberately avoids).
                String::new()
            }
            _ => format!("{{{{transform:{name}}}}}"),
        }
    }

    pub fn resolve(&self, template: &str) -> String {
        tokenize(template)
            .iter()
            .map(|field| self.resolve_field(field))
            .collect()
    }

    /// Same as [`resolve`](Self::resolve), but substitutes a pre-computed value
    /// for `{{transform:project-source}}` (the only transform requiring
    /// filesystem access, so the dispatch loop resolves it once up front).
    pub fn resolve_with_project_source(&self, template: &str, project_source: &str) -> String {
        tokenize(template)
            .iter()
            .map(|field| match field {
                MergeField::Transform { name, .. } if name == "project-source" => project_source.to_string(),
                other => self.resolve_field(other),
            })
            .collect()
    }
}

fn apply_named_transform(transform: Option<&str>, raw: &str) -> String {
    match transform {
        None | Some("raw") => raw.to_string(),
        Some("design-system") => render_design_system(raw),
        Some("file-manifest") => render_file_manifest(raw),
        Some("project-source") => String::new(),
        Some(_) => raw.to_string(),
    }
}

/// Parses architect output as JSON and, if `design_system` is present, renders
/// a fixed human-readable block (`spec.md` §4.1).
fn render_design_system(raw: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return String::new();
    };
    let Some(ds) = value.get("design_system") else {
        return String::new();
    };
    let brand_kernel = ds.get("brand_kernel").and_then(|v| v.as_str()).unwrap_or("");
    let colors = ds
        .get("colors")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .map(|(k, v)| format!("  {k}: {}", v.as_str().unwrap_or_default()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    let typography = ds.get("typography").and_then(|v| v.as_str()).unwrap_or("");
    let spacing = ds.get("spacing").and_then(|v| v.as_str()).unwrap_or("");
    let radius = ds.get("radius").and_then(|v| v.as_str()).unwrap_or("");
    format!(
        "Brand kernel: {brand_kernel}\nColors:\n{colors}\nTypography: {typography}\nSpacing: {spacing}\nRadius: {radius}"
    )
}

/// Scans output for `write_file` tool-call payloads and returns the sorted
/// list of paths (`spec.md` §4.1).
fn render_file_manifest(raw: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return String::new();
    };
    let Some(calls) = value.as_array() else {
        return String::new();
    };
    let mut paths: Vec<String> = calls
        .iter()
        .filter(|c| c.get("tool").and_then(|t| t.as_str()) == Some("write_file"))
        .filter_map(|c| c.get("path").and_then(|p| p.as_str()).map(String::from))
        .collect();
    paths.sort();
    paths.join("\n")
}

fn most_recent_dev_agent(outputs: &HashMap<String, String>) -> &'static str {
    const DEV_AGENTS: &[&str] = &["backend-dev", "frontend-dev", "styling-dev"];
    for agent in DEV_AGENTS {
        if outputs.contains_key(*agent) {
            return agent;
        }
    }
    "frontend-dev"
}
