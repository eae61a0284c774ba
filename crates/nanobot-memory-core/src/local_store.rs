use crate::paths::{memory_dir_in, sessions_dir_in};
use crate::types::HistoryEntry;
use crate::utils::{
    filename_stem_is_ambiguous, key_from_filename_stem, now_iso, safe_key_filename,
};
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const FACTS_FILE: &str = "MEMORY.md";
const HISTORY_NOTE_FILE: &str = "HISTORY.md";

pub trait LocalStore: Send + Sync {
    fn read_history(&self, key: &str) -> Result<Vec<HistoryEntry>>;

    fn read_facts(&self) -> Result<Option<String>>;

    fn read_history_note(&self) -> Result<Option<String>>;

    fn append_pending(&self, key: &str, entries: &[HistoryEntry]) -> Result<()>;

    fn list_conversations(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct FileLocalStore {
    sessions_dir: PathBuf,
    memory_dir: PathBuf,
}

fn read_optional_text(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

fn parse_history_line(line: &str, path: &Path, line_no: usize) -> Option<HistoryEntry> {
    let value = match serde_json::from_str::<Value>(line) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(path = %path.display(), line_no, %error, "skipping malformed history line");
            return None;
        }
    };
    if value.get("_type").and_then(Value::as_str) == Some("metadata") {
        return None;
    }
    match serde_json::from_value::<HistoryEntry>(value) {
        Ok(entry) => Some(entry),
        Err(error) => {
            tracing::warn!(path = %path.display(), line_no, %error, "skipping unreadable history entry");
            None
        }
    }
}

impl FileLocalStore {
    #[must_use]
    pub fn new(sessions_dir: PathBuf, memory_dir: PathBuf) -> Self {
        Self {
            sessions_dir,
            memory_dir,
        }
    }

    #[must_use]
    pub fn in_home(home: &Path) -> Self {
        Self::new(sessions_dir_in(home), memory_dir_in(home))
    }

    #[must_use]
    pub fn history_path(&self, key: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.jsonl", safe_key_filename(key)))
    }

    #[must_use]
    pub fn facts_path(&self) -> PathBuf {
        self.memory_dir.join(FACTS_FILE)
    }

    pub fn write_facts(&self, content: &str) -> Result<()> {
        fs::create_dir_all(&self.memory_dir)
            .with_context(|| format!("create memory dir {}", self.memory_dir.display()))?;
        let path = self.facts_path();
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))
    }
}

impl LocalStore for FileLocalStore {
    fn read_history(&self, key: &str) -> Result<Vec<HistoryEntry>> {
        let path = self.history_path(key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;

        Ok(text
            .lines()
            .enumerate()
            .map(|(index, line)| (index + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty())
            .filter_map(|(line_no, line)| parse_history_line(line, &path, line_no))
            .collect())
    }

    fn read_facts(&self) -> Result<Option<String>> {
        read_optional_text(&self.facts_path())
    }

    fn read_history_note(&self) -> Result<Option<String>> {
        read_optional_text(&self.memory_dir.join(HISTORY_NOTE_FILE))
    }

    fn append_pending(&self, key: &str, entries: &[HistoryEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.sessions_dir)
            .with_context(|| format!("create sessions dir {}", self.sessions_dir.display()))?;

        let stamp = now_iso();
        let mut payload = String::new();
        for entry in entries {
            let mut tagged = entry.clone();
            tagged.pending_sync = true;
            if tagged.timestamp.is_none() {
                tagged.timestamp = Some(stamp.clone());
            }
            payload.push_str(&serde_json::to_string(&tagged)?);
            payload.push('\n');
        }

        let path = self.history_path(key);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(payload.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        file.sync_data()
            .with_context(|| format!("sync {}", path.display()))?;
        Ok(())
    }

    fn list_conversations(&self) -> Result<Vec<String>> {
        if !self.sessions_dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = fs::read_dir(&self.sessions_dir)
            .with_context(|| format!("read dir {}", self.sessions_dir.display()))?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("jsonl"))
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?;
                if filename_stem_is_ambiguous(stem) {
                    tracing::warn!(
                        file = %path.display(),
                        key = %key_from_filename_stem(stem),
                        "history file name does not map back to a unique conversation key"
                    );
                }
                Some(key_from_filename_stem(stem))
            })
            .collect::<Vec<_>>();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::{FileLocalStore, LocalStore};
    use crate::types::{HistoryEntry, Role};
    use std::fs;

    fn store_in(temp: &tempfile::TempDir) -> FileLocalStore {
        FileLocalStore::in_home(temp.path())
    }

    #[test]
    fn reads_history_skipping_metadata_and_garbage() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        let path = store.history_path("telegram:42");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(
            &path,
            concat!(
                "{\"_type\":\"metadata\",\"created_at\":\"2026-01-01T00:00:00\",\"last_consolidated\":0}\n",
                "{\"role\":\"user\",\"content\":\"hi\",\"timestamp\":\"2026-01-01T00:00:01\"}\n",
                "not json\n",
                "\n",
                "{\"role\":\"assistant\",\"content\":\"hello!\",\"tools_used\":[\"exec\"]}\n",
            ),
        )
        .expect("write history");

        let history = store.read_history("telegram:42").expect("read");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].timestamp.as_deref(), Some("2026-01-01T00:00:01"));
        assert_eq!(history[1].content, "hello!");
    }

    #[test]
    fn pending_appends_never_touch_existing_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        let path = store.history_path("cli:direct");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "{\"role\":\"user\",\"content\":\"old\"}\n").expect("seed");

        store
            .append_pending(
                "cli:direct",
                &[
                    HistoryEntry::new(Role::User, "q"),
                    HistoryEntry::new(Role::Assistant, "a"),
                ],
            )
            .expect("append");

        let text = fs::read_to_string(&path).expect("read raw");
        assert!(text.starts_with("{\"role\":\"user\",\"content\":\"old\"}\n"));

        let history = store.read_history("cli:direct").expect("read");
        assert_eq!(history.len(), 3);
        assert!(!history[0].pending_sync);
        assert!(history[1].pending_sync && history[2].pending_sync);
        assert!(history[1].timestamp.is_some());
    }

    #[test]
    fn facts_and_conversation_listing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        assert_eq!(store.read_facts().expect("facts"), None);

        store.write_facts("- likes rust\n").expect("write facts");
        assert_eq!(store.read_facts().expect("facts").as_deref(), Some("- likes rust"));

        store
            .append_pending("telegram:7", &[HistoryEntry::new(Role::User, "x")])
            .expect("append");
        store
            .append_pending("discord:9", &[HistoryEntry::new(Role::User, "y")])
            .expect("append");
        assert_eq!(
            store.list_conversations().expect("list"),
            vec!["discord:9".to_string(), "telegram:7".to_string()]
        );
    }
}
