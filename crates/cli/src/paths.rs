//! Central path resolution for Huddle data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `HUDDLE_DATA_DIR` env > `~/.huddle`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("HUDDLE_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        default_data_dir()
    };

    let mut guard = DATA_DIR.write().unwrap_or_else(|e| e.into_inner());
    *guard = Some(dir.clone());
    dir
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".huddle")
}

/// Current data directory; the default location if `init_data_dir` was never called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .unwrap_or_else(default_data_dir)
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    std::fs::create_dir_all(log_dir())
}
