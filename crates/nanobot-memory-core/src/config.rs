use crate::utils::{parse_boolean, parse_positive_int};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

pub const API_KEY_ENV: &str = "HONCHO_API_KEY";
const SECTION: &str = "honcho";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HonchoSettings {
    pub enabled: bool,
    pub workspace_id: String,
    pub prefetch: bool,
    pub context_tokens: Option<u32>,
    pub environment: String,
    pub base_url: Option<String>,
    pub assistant_peer_id: String,
    pub timeout_ms: u64,
}

impl Default for HonchoSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            workspace_id: "nanobot".to_string(),
            prefetch: true,
            context_tokens: None,
            environment: "production".to_string(),
            base_url: None,
            assistant_peer_id: "nanobot".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartialHonchoSettings {
    enabled: Option<Value>,
    workspace_id: Option<String>,
    prefetch: Option<Value>,
    context_tokens: Option<i64>,
    environment: Option<String>,
    base_url: Option<String>,
    assistant_peer_id: Option<String>,
    timeout_ms: Option<i64>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_settings(partial: PartialHonchoSettings) -> HonchoSettings {
    let defaults = HonchoSettings::default();

    HonchoSettings {
        enabled: parse_boolean(partial.enabled, defaults.enabled),
        workspace_id: non_blank(partial.workspace_id).unwrap_or(defaults.workspace_id),
        prefetch: parse_boolean(partial.prefetch, defaults.prefetch),
        context_tokens: partial
            .context_tokens
            .filter(|tokens| *tokens > 0)
            .map(|tokens| u32::try_from(tokens).unwrap_or(u32::MAX)),
        environment: non_blank(partial.environment)
            .map(|env| env.to_lowercase())
            .unwrap_or(defaults.environment),
        base_url: non_blank(partial.base_url),
        assistant_peer_id: non_blank(partial.assistant_peer_id)
            .unwrap_or(defaults.assistant_peer_id),
        timeout_ms: parse_positive_int(partial.timeout_ms, defaults.timeout_ms as usize) as u64,
    }
}

fn read_raw_config(config_path: &Path) -> anyhow::Result<Option<Value>> {
    if !config_path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("read config {}", config_path.display()))?;
    let value = serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("parse config {}", config_path.display()))?;
    Ok(Some(value))
}

pub fn load_settings_at(config_path: &Path) -> anyhow::Result<HonchoSettings> {
    let Some(root) = read_raw_config(config_path)? else {
        return Ok(HonchoSettings::default());
    };
    let Some(section) = root.get(SECTION) else {
        return Ok(HonchoSettings::default());
    };

    match serde_json::from_value::<PartialHonchoSettings>(section.clone()) {
        Ok(partial) => Ok(normalize_settings(partial)),
        Err(error) => {
            tracing::warn!(
                path = %config_path.display(),
                %error,
                "invalid honcho section in config; using defaults"
            );
            Ok(HonchoSettings::default())
        }
    }
}

pub fn update_settings_at<F>(config_path: &Path, update: F) -> anyhow::Result<HonchoSettings>
where
    F: FnOnce(&mut Map<String, Value>),
{
    let Some(parent) = config_path.parent() else {
        anyhow::bail!("invalid config path")
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("create config dir {}", parent.display()))?;

    let mut root = read_raw_config(config_path)?.unwrap_or_else(|| Value::Object(Map::new()));
    let Some(object) = root.as_object_mut() else {
        anyhow::bail!("config {} is not a JSON object", config_path.display())
    };
    let section = object
        .entry(SECTION)
        .or_insert_with(|| Value::Object(Map::new()));
    if !section.is_object() {
        *section = Value::Object(Map::new());
    }
    if let Some(section) = section.as_object_mut() {
        update(section);
    }

    let text = serde_json::to_string_pretty(&root)?;
    fs::write(config_path, format!("{text}\n"))
        .with_context(|| format!("write config {}", config_path.display()))?;

    load_settings_at(config_path)
}

fn parse_env_line(line: &str) -> Option<String> {
    let value = line.trim().strip_prefix(API_KEY_ENV)?.strip_prefix('=')?;
    let value = value.trim().trim_matches('"').trim_matches('\'');
    (!value.is_empty()).then(|| value.to_string())
}

#[must_use]
pub fn resolve_credential(env_path: &Path) -> Option<String> {
    if let Ok(value) = std::env::var(API_KEY_ENV)
        && !value.trim().is_empty()
    {
        return Some(value.trim().to_string());
    }

    let text = fs::read_to_string(env_path).ok()?;
    text.lines().find_map(parse_env_line)
}

pub fn write_env_key(env_path: &Path, api_key: &str) -> anyhow::Result<()> {
    if let Some(parent) = env_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create env dir {}", parent.display()))?;
    }

    let existing = if env_path.exists() {
        fs::read_to_string(env_path).with_context(|| format!("read {}", env_path.display()))?
    } else {
        String::new()
    };

    let entry = format!("{API_KEY_ENV}={api_key}");
    let mut found = false;
    let mut lines = existing
        .lines()
        .map(|line| {
            if line.starts_with(&format!("{API_KEY_ENV}=")) {
                found = true;
                entry.clone()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>();
    if !found {
        lines.push(entry);
    }

    fs::write(env_path, format!("{}\n", lines.join("\n")))
        .with_context(|| format!("write {}", env_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{HonchoSettings, load_settings_at, parse_env_line, update_settings_at, write_env_key};
    use serde_json::{Value, json};
    use std::fs;

    #[test]
    fn missing_config_yields_disabled_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = load_settings_at(&temp.path().join("config.json")).expect("load");
        assert_eq!(settings, HonchoSettings::default());
        assert!(!settings.enabled);
    }

    #[test]
    fn partial_section_is_normalized_onto_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("config.json");
        fs::write(
            &config_path,
            r#"{"agents": {"model": "x"}, "honcho": {"enabled": "yes", "workspaceId": "  ", "contextTokens": 800, "environment": "Demo"}}"#,
        )
        .expect("write config");

        let settings = load_settings_at(&config_path).expect("load");
        assert!(settings.enabled);
        assert_eq!(settings.workspace_id, "nanobot");
        assert_eq!(settings.context_tokens, Some(800));
        assert_eq!(settings.environment, "demo");
        assert!(settings.prefetch);
    }

    #[test]
    fn update_preserves_unrelated_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("config.json");
        fs::write(&config_path, r#"{"agents": {"model": "x"}}"#).expect("write config");

        let settings = update_settings_at(&config_path, |section| {
            section.insert("enabled".to_string(), json!(true));
            section
                .entry("workspaceId")
                .or_insert_with(|| json!("nanobot"));
        })
        .expect("update");
        assert!(settings.enabled);

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&config_path).expect("read")).expect("json");
        assert_eq!(raw["agents"]["model"], "x");
        assert_eq!(raw["honcho"]["enabled"], true);
    }

    #[test]
    fn env_key_is_replaced_not_duplicated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env_path = temp.path().join(".env");
        fs::write(&env_path, "OTHER=1\nHONCHO_API_KEY=old\n").expect("write env");

        write_env_key(&env_path, "new").expect("write key");
        let text = fs::read_to_string(&env_path).expect("read env");
        assert_eq!(text, "OTHER=1\nHONCHO_API_KEY=new\n");
        assert_eq!(parse_env_line("HONCHO_API_KEY=\"quoted\""), Some("quoted".to_string()));
        assert_eq!(parse_env_line("HONCHO_API_KEY="), None);
    }
}
