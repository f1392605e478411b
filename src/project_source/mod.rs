use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::path::Path;

/// Reads the project tree for the `{{transform:project-source}}` merge field
/// (`spec.md` §4.1, §6). Grounded in the teacher's `list_files`/`read_file` tool
/// implementation (`engine/tools/file_tools.rs`), which already walks with
/// `ignore::WalkBuilder` and filters hidden entries.
fn skip_globs() -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    builder.add(Glob::new("**/node_modules/**").unwrap());
    builder.add(Glob::new("**/.*").unwrap());
    builder.add(Glob::new("**/.*/**").unwrap());
    builder.build().unwrap()
}

fn looks_like_text(bytes: &[u8]) -> bool {
    let sample = &bytes[..bytes.len().min(8192)];
    if sample.contains(&0) {
        return false;
    }
    std::str::from_utf8(sample).is_ok()
}

/// Concatenates every non-dotfile, non-`node_modules`, text file under `root`
/// into one labeled block, capped at `max_chars` (`spec.md` §6).
pub fn read_project_source(root: &Path, max_chars: usize) -> String {
    let skip = skip_globs();
    let mut out = String::new();
    let walker = WalkBuilder::new(root).standard_filters(true).hidden(true).build();

    for entry in walker {
        if out.chars().count() >= max_chars {
            break;
        }
        let Ok(entry) = entry else { continue };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(root) else { continue };
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if skip.is_match(&rel_str) {
            continue;
        }
        let Ok(bytes) = std::fs::read(path) else { continue };
        if !looks_like_text(&bytes) {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        out.push_str(&format!("--- {rel_str} ---\n{text}\n"));
    }

    if out.chars().count() > max_chars {
        let truncated: String = out.chars().take(max_chars).collect();
        format!("{truncated}\n... (truncated)")
    } else {
        out
    }
}
