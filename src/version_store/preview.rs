use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct PreviewState {
    pub original_head: String,
    pub preview_sha: String,
}

/// Process-wide keyed-mutex table of active previews, one per normalized project
/// path (`spec.md` §3, §9 design note "In-memory preview map → keyed mutex
/// table"). The working tree is always recoverable from `original_head` because
/// HEAD itself never moves while a preview is active.
#[derive(Default)]
pub struct PreviewRegistry {
    active: Mutex<HashMap<PathBuf, PreviewState>>,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, path: &PathBuf, state: PreviewState) {
        self.active.lock().unwrap().insert(path.clone(), state);
    }

    pub fn get(&self, path: &PathBuf) -> Option<PreviewState> {
        self.active.lock().unwrap().get(path).cloned()
    }

    pub fn is_active(&self, path: &PathBuf) -> bool {
        self.active.lock().unwrap().contains_key(path)
    }

    pub fn exit(&self, path: &PathBuf) -> Option<PreviewState> {
        self.active.lock().unwrap().remove(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_preview_per_path() {
        let registry = PreviewRegistry::new();
        let path = PathBuf::from("/projects/demo");
        assert!(!registry.is_active(&path));
        registry.enter(
            &path,
            PreviewState {
                original_head: "aaa".into(),
                preview_sha: "bbb".into(),
            },
        );
        assert!(registry.is_active(&path));
        registry.enter(
            &path,
            PreviewState {
                original_head: "aaa".into(),
                preview_sha: "ccc".into(),
            },
        );
        assert_eq!(registry.get(&path).unwrap().preview_sha, "ccc");
        let exited = registry.exit(&path).unwrap();
        assert_eq!(exited.original_head, "aaa");
        assert!(!registry.is_active(&path));
    }
}
