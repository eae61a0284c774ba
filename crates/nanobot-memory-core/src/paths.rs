use std::path::{Path, PathBuf};

#[must_use]
pub fn resolve_nanobot_home() -> PathBuf {
    if let Ok(value) = std::env::var("NANOBOT_HOME")
        && !value.trim().is_empty()
    {
        return PathBuf::from(value);
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nanobot")
}

#[must_use]
pub fn config_path_in(home: &Path) -> PathBuf {
    home.join("config.json")
}

#[must_use]
pub fn env_path_in(home: &Path) -> PathBuf {
    home.join(".env")
}

#[must_use]
pub fn sessions_dir_in(home: &Path) -> PathBuf {
    home.join("sessions")
}

#[must_use]
pub fn memory_dir_in(home: &Path) -> PathBuf {
    home.join("workspace").join("memory")
}

#[must_use]
pub fn ledger_path_in(home: &Path) -> PathBuf {
    home.join("memory-sync.sqlite")
}
