use crate::backend::MemoryBackend;
use crate::config::HonchoSettings;
use crate::error::{MemoryError, MemoryResult};
use crate::types::{RemoteMessage, RemoteSession, Role, SessionContext};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use url::Url;

pub const MAX_MESSAGES_PER_REQUEST: usize = 100;
const API_VERSION: &str = "v2";

#[must_use]
pub fn base_url_for_environment(environment: &str) -> Option<&'static str> {
    match environment.trim().to_lowercase().as_str() {
        "production" | "prod" => Some("https://api.honcho.dev"),
        "demo" => Some("https://demo.honcho.dev"),
        "local" => Some("http://localhost:8000"),
        _ => None,
    }
}

#[derive(Clone)]
pub struct RemoteClientConfig {
    workspace_id: String,
    environment: String,
    api_key: String,
    base_url: Url,
    timeout: Duration,
}

impl Debug for RemoteClientConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClientConfig")
            .field("workspace_id", &self.workspace_id)
            .field("environment", &self.environment)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url.as_str())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn parse_base_url(raw: &str) -> MemoryResult<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|error| MemoryError::Config(format!("invalid base url '{raw}': {error}")))?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(MemoryError::Config(format!(
            "base url '{raw}' must be an http(s) url"
        )));
    }
    Ok(url)
}

impl RemoteClientConfig {
    pub fn new(workspace_id: &str, environment: &str, api_key: Option<&str>) -> MemoryResult<Self> {
        let workspace_id = workspace_id.trim();
        if workspace_id.is_empty() {
            return Err(MemoryError::Config("workspace id is required".to_string()));
        }
        let Some(api_key) = api_key.map(str::trim).filter(|key| !key.is_empty()) else {
            return Err(MemoryError::Config(
                "remote memory credential is required".to_string(),
            ));
        };
        let Some(base) = base_url_for_environment(environment) else {
            return Err(MemoryError::Config(format!(
                "unknown environment '{environment}' (expected production|demo|local or set baseUrl)"
            )));
        };

        Ok(Self {
            workspace_id: workspace_id.to_string(),
            environment: environment.trim().to_lowercase(),
            api_key: api_key.to_string(),
            base_url: parse_base_url(base)?,
            timeout: Duration::from_secs(10),
        })
    }

    pub fn from_settings(settings: &HonchoSettings, api_key: Option<&str>) -> MemoryResult<Self> {
        let environment = if settings.base_url.is_some()
            && base_url_for_environment(&settings.environment).is_none()
        {
            "production"
        } else {
            settings.environment.as_str()
        };
        let mut config = Self::new(&settings.workspace_id, environment, api_key)?
            .with_timeout(Duration::from_millis(settings.timeout_ms));
        if let Some(base_url) = settings.base_url.as_deref() {
            config = config.with_base_url(base_url)?;
            config.environment.clone_from(&settings.environment);
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, raw: &str) -> MemoryResult<Self> {
        self.base_url = parse_base_url(raw)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

pub struct RemoteMemoryClient {
    config: RemoteClientConfig,
    http: Client,
    workspace_ready: AtomicBool,
    ensured_sessions: Mutex<HashSet<String>>,
}

impl Debug for RemoteMemoryClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMemoryClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

#[must_use]
pub fn parse_context_response(response: &Value, assistant_peer: &str) -> SessionContext {
    let summary = response.get("summary").and_then(|summary| match summary {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Object(_) => string_field(summary, "content"),
        _ => None,
    });

    let messages = response
        .get("messages")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let content = string_field(item, "content")?;
                    let role = if item.get("peer_id").and_then(Value::as_str) == Some(assistant_peer)
                    {
                        Role::Assistant
                    } else {
                        Role::User
                    };
                    Some(RemoteMessage {
                        role,
                        content,
                        created_at: string_field(item, "created_at"),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let peer_card = match response.get("peer_card") {
        Some(Value::Array(lines)) => lines
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(text)) if !text.trim().is_empty() => vec![text.trim().to_string()],
        _ => Vec::new(),
    };

    SessionContext {
        summary,
        messages,
        representation: string_field(response, "peer_representation"),
        peer_card,
    }
}

fn message_payload(session: &RemoteSession, message: &RemoteMessage) -> Value {
    let mut payload = json!({
        "peer_id": session.peer_for(message.role).id(),
        "content": message.content,
    });
    if let Some(created_at) = &message.created_at {
        payload["metadata"] = json!({ "original_timestamp": created_at });
    }
    payload
}

impl RemoteMemoryClient {
    pub fn new(config: RemoteClientConfig) -> MemoryResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|error| MemoryError::Config(format!("build http client: {error}")))?;
        Ok(Self {
            config,
            http,
            workspace_ready: AtomicBool::new(false),
            ensured_sessions: Mutex::new(HashSet::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RemoteClientConfig {
        &self.config
    }

    fn endpoint(&self, segments: &[&str]) -> MemoryResult<Url> {
        let mut url = self.config.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| MemoryError::Config("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(API_VERSION)
            .extend(segments);
        Ok(url)
    }

    fn workspace_endpoint(&self, segments: &[&str]) -> MemoryResult<Url> {
        let mut full = vec!["workspaces", self.config.workspace_id.as_str()];
        full.extend_from_slice(segments);
        self.endpoint(&full)
    }

    async fn send(&self, request: RequestBuilder) -> MemoryResult<Value> {
        let response = request.bearer_auth(&self.config.api_key).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(MemoryError::unavailable(format!(
                "remote memory returned {status}: {}",
                crate::utils::truncate_chars(body.trim(), 300)
            )));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|error| MemoryError::unavailable(format!("undecodable response: {error}")))
    }

    async fn post(&self, url: Url, body: &Value) -> MemoryResult<Value> {
        self.send(self.http.post(url).json(body)).await
    }

    async fn ensure_workspace(&self) -> MemoryResult<()> {
        if self.workspace_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let url = self.endpoint(&["workspaces"])?;
        self.post(url, &json!({ "id": self.config.workspace_id }))
            .await?;
        self.workspace_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn is_ensured(&self, session_id: &str) -> bool {
        self.ensured_sessions
            .lock()
            .is_ok_and(|ensured| ensured.contains(session_id))
    }

    async fn ensure_session(&self, session: &RemoteSession) -> MemoryResult<()> {
        if self.is_ensured(session.id().as_str()) {
            return Ok(());
        }
        self.ensure_workspace().await?;

        let peers_url = self.workspace_endpoint(&["peers"])?;
        for peer in [session.user(), session.assistant()] {
            self.post(
                peers_url.clone(),
                &json!({
                    "id": peer.id(),
                    "configuration": { "observe_me": peer.observe_me() },
                }),
            )
            .await?;
        }

        let mut peers = serde_json::Map::new();
        for peer in [session.user(), session.assistant()] {
            peers.insert(
                peer.id().to_string(),
                json!({
                    "observe_me": peer.observe_me(),
                    "observe_others": peer.observe_others(),
                }),
            );
        }
        self.post(
            self.workspace_endpoint(&["sessions"])?,
            &json!({ "id": session.id(), "peers": peers }),
        )
        .await?;

        if let Ok(mut ensured) = self.ensured_sessions.lock() {
            ensured.insert(session.id().to_string());
        }
        tracing::debug!(session = %session.id(), "remote session ensured");
        Ok(())
    }
}

#[async_trait]
impl MemoryBackend for RemoteMemoryClient {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn add_messages(
        &self,
        session: &RemoteSession,
        messages: &[RemoteMessage],
    ) -> MemoryResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.ensure_session(session).await?;
        let url = self.workspace_endpoint(&["sessions", session.id().as_str(), "messages"])?;

        for chunk in messages.chunks(MAX_MESSAGES_PER_REQUEST) {
            let payload = chunk
                .iter()
                .map(|message| message_payload(session, message))
                .collect::<Vec<_>>();
            self.post(url.clone(), &json!({ "messages": payload }))
                .await?;
        }
        Ok(())
    }

    async fn context(
        &self,
        session: &RemoteSession,
        token_budget: Option<u32>,
    ) -> MemoryResult<SessionContext> {
        self.ensure_session(session).await?;
        let mut url = self.workspace_endpoint(&["sessions", session.id().as_str(), "context"])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(tokens) = token_budget {
                query.append_pair("tokens", &tokens.to_string());
            }
            query.append_pair("peer_target", session.user().id().as_str());
            query.append_pair("summary", "true");
        }

        let response = self.send(self.http.get(url)).await?;
        Ok(parse_context_response(
            &response,
            session.assistant().id().as_str(),
        ))
    }

    async fn record_fact(&self, session: &RemoteSession, fact: &str) -> MemoryResult<()> {
        self.ensure_session(session).await?;
        let url = self.workspace_endpoint(&["sessions", session.id().as_str(), "messages"])?;
        self.post(
            url,
            &json!({
                "messages": [{
                    "peer_id": session.user().id(),
                    "content": fact,
                    "metadata": { "kind": "memory_fact" },
                }]
            }),
        )
        .await?;
        Ok(())
    }

    async fn query(&self, session: &RemoteSession, query: &str) -> MemoryResult<String> {
        self.ensure_session(session).await?;
        let url = self.workspace_endpoint(&["peers", session.assistant().id().as_str(), "chat"])?;
        let response = self
            .post(
                url,
                &json!({
                    "query": query,
                    "session_id": session.id(),
                    "target": session.user().id(),
                }),
            )
            .await?;
        Ok(string_field(&response, "content").unwrap_or_default())
    }
}
