use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const CHARS_PER_TOKEN: usize = 4;

#[must_use]
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

#[must_use]
pub fn now_iso() -> String {
    now_utc().to_rfc3339()
}

#[must_use]
pub fn sha256(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[must_use]
pub fn parse_positive_int(input: Option<i64>, fallback: usize) -> usize {
    let Some(raw) = input else {
        return fallback;
    };
    if raw <= 0 {
        return fallback;
    }
    raw as usize
}

#[must_use]
pub fn parse_boolean(input: Option<Value>, fallback: bool) -> bool {
    let Some(value) = input else {
        return fallback;
    };

    match value {
        Value::Bool(v) => v,
        Value::String(v) => match v.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => fallback,
        },
        Value::Number(v) => {
            if v.as_i64() == Some(1) {
                true
            } else if v.as_i64() == Some(0) {
                false
            } else {
                fallback
            }
        }
        _ => fallback,
    }
}

#[must_use]
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>()
}

#[must_use]
pub fn char_budget(token_budget: Option<u32>) -> Option<usize> {
    token_budget.map(|tokens| (tokens as usize).saturating_mul(CHARS_PER_TOKEN))
}

#[must_use]
pub fn safe_key_filename(key: &str) -> String {
    key.replace(':', "_")
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

// Only the first `_` is restored; later ones may have been `_`, `:` or any other
// character `safe_key_filename` replaced.
#[must_use]
pub fn key_from_filename_stem(stem: &str) -> String {
    stem.replacen('_', ":", 1)
}

#[must_use]
pub fn filename_stem_is_ambiguous(stem: &str) -> bool {
    stem.matches('_').count() > 1
}
