use crate::utils::sha256;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, OnceLock};

pub const MAX_ID_LEN: usize = 100;
const HASH_SUFFIX_LEN: usize = 12;
const EMPTY_ID: &str = "default";

fn illegal_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]").expect("valid sanitizer regex"))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SanitizedId(String);

impl SanitizedId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn with_suffix(&self, suffix: &str) -> Self {
        sanitize(&format!("{}-{suffix}", self.0))
    }
}

impl Display for SanitizedId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SanitizedId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[must_use]
pub fn sanitize(raw: &str) -> SanitizedId {
    if raw.is_empty() {
        return SanitizedId(EMPTY_ID.to_string());
    }

    let replaced = illegal_chars().replace_all(raw, "-").into_owned();
    if replaced.len() <= MAX_ID_LEN {
        return SanitizedId(replaced);
    }

    // Only ASCII survives the replacement, so byte slicing is char-aligned.
    let keep = MAX_ID_LEN - HASH_SUFFIX_LEN - 1;
    let digest = sha256(raw);
    SanitizedId(format!(
        "{}-{}",
        &replaced[..keep],
        &digest[..HASH_SUFFIX_LEN]
    ))
}

#[derive(Debug, Default)]
pub struct CollisionGuard {
    seen: Mutex<HashMap<SanitizedId, String>>,
}

impl CollisionGuard {
    pub fn sanitize(&self, raw: &str) -> SanitizedId {
        let id = sanitize(raw);
        let Ok(mut seen) = self.seen.lock() else {
            return id;
        };
        match seen.get(&id) {
            Some(existing) if existing != raw => {
                tracing::warn!(
                    sanitized = %id,
                    first = %existing,
                    second = %raw,
                    "distinct conversation keys share one sanitized id"
                );
            }
            Some(_) => {}
            None => {
                seen.insert(id.clone(), raw.to_string());
            }
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::{CollisionGuard, MAX_ID_LEN, sanitize};
    use regex::Regex;

    #[test]
    fn replaces_illegal_characters() {
        assert_eq!(sanitize("telegram:8281248569").as_str(), "telegram-8281248569");
        assert_eq!(sanitize("slack:C01/thread.42").as_str(), "slack-C01-thread-42");
        assert_eq!(sanitize("already_legal-id").as_str(), "already_legal-id");
        assert_eq!(sanitize("ünï cødé").as_str(), "-n--c-d-");
    }

    #[test]
    fn output_is_deterministic_and_legal() {
        let legal = Regex::new(r"^[A-Za-z0-9_-]+$").expect("regex");
        let mut inputs = ["", " ", "telegram:42", "discord:guild/channel#1", "emoji 🚀 key"]
            .map(str::to_string)
            .to_vec();
        inputs.push("a".repeat(250));
        inputs.push("x:".repeat(80));

        for raw in &inputs {
            let first = sanitize(raw);
            let second = sanitize(raw);
            assert_eq!(first, second);
            assert!(legal.is_match(first.as_str()), "illegal id for {raw:?}: {first}");
            assert!(first.as_str().len() <= MAX_ID_LEN);
        }
    }

    #[test]
    fn long_ids_keep_distinct_hash_suffixes() {
        let a = sanitize(&format!("{}a", "k".repeat(120)));
        let b = sanitize(&format!("{}b", "k".repeat(120)));
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), MAX_ID_LEN);
    }

    #[test]
    fn suffix_keeps_id_legal() {
        let base = sanitize("telegram:42");
        assert_eq!(base.with_suffix("ab12cd34").as_str(), "telegram-42-ab12cd34");
    }

    #[test]
    fn collision_guard_tolerates_collisions() {
        let guard = CollisionGuard::default();
        let first = guard.sanitize("chat:1");
        let second = guard.sanitize("chat/1");
        assert_eq!(first, second);
        assert_eq!(guard.sanitize("chat:1"), first);
    }
}
