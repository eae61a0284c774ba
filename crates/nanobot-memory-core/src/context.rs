use crate::types::{RemoteMessage, Role, SessionContext};
use crate::utils::{char_budget, truncate_chars};
use serde::{Deserialize, Serialize};

pub const CONTEXT_HEADER: &str = "# User Context";
const SECTION_SEPARATOR: &str = "\n\n";
const MIN_SECTION_BODY_CHARS: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextWindow {
    pub representation: Option<String>,
    pub peer_card: Vec<String>,
    pub summary: Option<String>,
    pub messages: Vec<RemoteMessage>,
    pub facts: Option<String>,
    pub token_budget: Option<u32>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

impl ContextWindow {
    #[must_use]
    pub fn empty(token_budget: Option<u32>) -> Self {
        Self {
            token_budget,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_remote(context: SessionContext, token_budget: Option<u32>) -> Self {
        Self {
            representation: non_blank(context.representation),
            peer_card: context
                .peer_card
                .into_iter()
                .filter(|line| !line.trim().is_empty())
                .collect(),
            summary: non_blank(context.summary),
            messages: context
                .messages
                .into_iter()
                .filter(|message| !message.content.trim().is_empty())
                .collect(),
            facts: None,
            token_budget,
        }
    }

    #[must_use]
    pub fn from_facts(facts: Option<String>, token_budget: Option<u32>) -> Self {
        Self {
            facts: non_blank(facts),
            ..Self::empty(token_budget)
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.representation.is_none()
            && self.peer_card.is_empty()
            && self.summary.is_none()
            && self.messages.is_empty()
            && self.facts.is_none()
    }

    fn text_sections(&self) -> Vec<(&'static str, String)> {
        let mut sections = Vec::new();
        if let Some(representation) = &self.representation {
            sections.push(("About the User", representation.trim().to_string()));
        }
        if !self.peer_card.is_empty() {
            let card = self
                .peer_card
                .iter()
                .map(|line| format!("- {}", line.trim()))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(("User Card", card));
        }
        if let Some(summary) = &self.summary {
            sections.push(("Conversation Summary", summary.trim().to_string()));
        }
        if let Some(facts) = &self.facts {
            sections.push(("Remembered Facts", facts.trim().to_string()));
        }
        sections
    }

    fn render_messages(&self, remaining: Option<usize>) -> Option<String> {
        if self.messages.is_empty() {
            return None;
        }
        let heading = "## Recent Messages";
        let mut used = SECTION_SEPARATOR.len() + heading.len();
        if remaining.is_some_and(|room| used > room) {
            return None;
        }

        let mut lines = Vec::new();
        for message in self.messages.iter().rev() {
            let speaker = match message.role {
                Role::Assistant => "assistant",
                _ => "user",
            };
            let line = format!("{speaker}: {}", message.content.trim());
            let needed = line.chars().count() + 1;
            if remaining.is_some_and(|room| used + needed > room) {
                break;
            }
            used += needed;
            lines.push(line);
        }
        if lines.is_empty() {
            return None;
        }
        lines.reverse();
        Some(format!("{heading}\n{}", lines.join("\n")))
    }

    #[must_use]
    pub fn render(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let limit = char_budget(self.token_budget);
        let mut used = CONTEXT_HEADER.chars().count();
        if limit.is_some_and(|limit| used > limit) {
            return String::new();
        }

        let mut sections = Vec::new();
        for (title, body) in self.text_sections() {
            let heading = format!("## {title}\n");
            let overhead = SECTION_SEPARATOR.len() + heading.chars().count();
            let section = match limit {
                None => format!("{heading}{body}"),
                Some(limit) => {
                    let room = limit.saturating_sub(used + overhead);
                    if room < MIN_SECTION_BODY_CHARS.min(body.chars().count()) || room == 0 {
                        continue;
                    }
                    format!("{heading}{}", truncate_chars(&body, room))
                }
            };
            used += SECTION_SEPARATOR.len() + section.chars().count();
            sections.push(section);
        }

        if let Some(section) = self.render_messages(limit.map(|limit| limit.saturating_sub(used))) {
            sections.push(section);
        }

        if sections.is_empty() {
            String::new()
        } else {
            format!(
                "{CONTEXT_HEADER}{SECTION_SEPARATOR}{}",
                sections.join(SECTION_SEPARATOR)
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPayload {
    pub messages: Vec<PromptMessage>,
}

impl PromptPayload {
    pub fn new(system: impl Into<String>, history: Vec<PromptMessage>) -> Self {
        let mut messages = vec![PromptMessage::new(Role::System, system)];
        messages.extend(history);
        Self { messages }
    }
}

#[must_use]
pub fn build_prompt(base: &PromptPayload, window: &ContextWindow) -> PromptPayload {
    let block = window.render();
    if block.is_empty() {
        return base.clone();
    }

    let mut payload = base.clone();
    match payload.messages.first_mut() {
        Some(first) if first.role == Role::System => {
            if first.content.trim().is_empty() {
                first.content = block;
            } else {
                first.content = format!("{}{SECTION_SEPARATOR}{block}", first.content.trim_end());
            }
        }
        _ => payload
            .messages
            .insert(0, PromptMessage::new(Role::System, block)),
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::{CONTEXT_HEADER, ContextWindow, PromptMessage, PromptPayload, build_prompt};
    use crate::types::{RemoteMessage, Role, SessionContext};

    fn base() -> PromptPayload {
        PromptPayload::new(
            "You are nanobot.",
            vec![
                PromptMessage::new(Role::User, "earlier"),
                PromptMessage::new(Role::Assistant, "reply"),
            ],
        )
    }

    #[test]
    fn empty_window_is_a_no_op() {
        let payload = base();
        assert_eq!(build_prompt(&payload, &ContextWindow::default()), payload);
        assert_eq!(
            build_prompt(&payload, &ContextWindow::from_facts(Some("  ".into()), None)),
            payload
        );
    }

    #[test]
    fn context_lands_in_system_message_before_history() {
        let window = ContextWindow::from_remote(
            SessionContext {
                summary: Some("Discussed travel plans.".into()),
                messages: vec![RemoteMessage::user("hi"), RemoteMessage::assistant("hello!")],
                representation: Some("Enjoys hiking.".into()),
                peer_card: vec!["Lives in Oslo".into()],
            },
            None,
        );
        let payload = build_prompt(&base(), &window);

        assert_eq!(payload.messages.len(), 3);
        let system = &payload.messages[0];
        assert_eq!(system.role, Role::System);
        assert!(system.content.starts_with("You are nanobot.\n\n# User Context"));
        assert!(system.content.contains("## About the User\nEnjoys hiking."));
        assert!(system.content.contains("- Lives in Oslo"));
        assert!(system.content.contains("user: hi\nassistant: hello!"));
        assert_eq!(payload.messages[1].content, "earlier");
    }

    #[test]
    fn missing_system_message_gets_one_inserted() {
        let payload = PromptPayload {
            messages: vec![PromptMessage::new(Role::User, "question")],
        };
        let window = ContextWindow::from_facts(Some("- prefers tea".into()), None);
        let merged = build_prompt(&payload, &window);
        assert_eq!(merged.messages.len(), 2);
        assert_eq!(merged.messages[0].role, Role::System);
        assert!(merged.messages[0].content.starts_with(CONTEXT_HEADER));
        assert_eq!(merged.messages[1].content, "question");
    }

    #[test]
    fn render_respects_token_budget_and_keeps_newest_messages() {
        let messages = (0..50)
            .flat_map(|i| {
                [
                    RemoteMessage::user(format!("question number {i}")),
                    RemoteMessage::assistant(format!("answer number {i}")),
                ]
            })
            .collect::<Vec<_>>();
        let window = ContextWindow::from_remote(
            SessionContext {
                summary: Some("s".repeat(500)),
                messages,
                ..SessionContext::default()
            },
            Some(100),
        );

        let rendered = window.render();
        assert!(rendered.chars().count() <= 400, "len {}", rendered.chars().count());
        assert!(rendered.contains("## Conversation Summary"));

        let unbounded = ContextWindow {
            token_budget: None,
            ..window.clone()
        }
        .render();
        assert!(unbounded.contains("answer number 49"));
        assert!(unbounded.contains("question number 0"));
    }

    #[test]
    fn tiny_budget_renders_nothing() {
        let window = ContextWindow::from_facts(Some("- likes rust".into()), Some(2));
        assert_eq!(window.render(), "");
    }
}
