use std::path::PathBuf;
use std::sync::OnceLock;

static PROJECTS_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// The fixed `projects/` sandbox root (`spec.md` §6). Every project path must lie
/// strictly under this directory. Cached via `OnceLock`, as the teacher caches its
/// home directory.
pub fn projects_root() -> &'static PathBuf {
    PROJECTS_ROOT.get_or_init(|| {
        let root = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("projects");
        let _ = std::fs::create_dir_all(&root);
        root
    })
}

/// `DB_PATH` env override; defaults to `<cwd>/data/pipeline.db`.
pub fn db_path() -> PathBuf {
    if let Ok(val) = std::env::var("DB_PATH") {
        if !val.is_empty() {
            return PathBuf::from(val);
        }
    }
    PathBuf::from("data").join("pipeline.db")
}

/// `LOG_DIR` env override; defaults to `<cwd>/logs`.
pub fn log_dir() -> PathBuf {
    if let Ok(val) = std::env::var("LOG_DIR") {
        if !val.is_empty() {
            return PathBuf::from(val);
        }
    }
    PathBuf::from("logs")
}

/// `FONTS_DIR` env override. Font upload itself is out of scope, but the path is
/// still part of the configured environment surface (`spec.md` §6).
pub fn fonts_dir() -> PathBuf {
    if let Ok(val) = std::env::var("FONTS_DIR") {
        if !val.is_empty() {
            return PathBuf::from(val);
        }
    }
    PathBuf::from("fonts")
}
