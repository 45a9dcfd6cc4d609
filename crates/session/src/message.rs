use palaver_llm::{ProviderAttachment, Role as ProviderRole};
use palaver_storage::{AttachmentRecord, MessageId, MessageRecord, MessageRole, StoredContent};

/// Content type attached to images picked in the composer.
pub const IMAGE_ATTACHMENT_CONTENT_TYPE: &str = "image/base64";

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Message body: plain text or a structured payload compared by value.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Structured(serde_json::Value),
}

impl MessageContent {
    /// Text as it would be typed into the composer.
    ///
    /// Structured payloads contribute their `{"type": "text", "text": ..}` parts.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(serde_json::Value::String(text)) => text.clone(),
            Self::Structured(serde_json::Value::Array(parts)) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(serde_json::Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Structured(_) => String::new(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.to_text().trim().is_empty()
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content_type: String,
    pub url: String,
}

impl Attachment {
    /// Wraps one encoded image from the composer.
    pub fn image(encoded: impl Into<String>) -> Self {
        Self {
            content_type: IMAGE_ATTACHMENT_CONTENT_TYPE.to_string(),
            url: encoded.into(),
        }
    }
}

/// One entry of the timeline. Identity is `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: MessageContent,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn text(&self) -> String {
        self.content.to_text()
    }

    pub(crate) fn push_text(&mut self, chunk: &str) {
        match &mut self.content {
            MessageContent::Text(text) => text.push_str(chunk),
            MessageContent::Structured(_) => {
                let mut text = self.content.to_text();
                text.push_str(chunk);
                self.content = MessageContent::Text(text);
            }
        }
    }
}

impl From<&Message> for MessageRecord {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            role: match message.role {
                Role::System => MessageRole::System,
                Role::User => MessageRole::User,
                Role::Assistant => MessageRole::Assistant,
            },
            content: match &message.content {
                MessageContent::Text(text) => StoredContent::Text(text.clone()),
                MessageContent::Structured(value) => StoredContent::Structured(value.clone()),
            },
            attachments: message
                .attachments
                .iter()
                .map(|attachment| AttachmentRecord {
                    content_type: attachment.content_type.clone(),
                    url: attachment.url.clone(),
                })
                .collect(),
        }
    }
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Self {
            id: record.id,
            role: match record.role {
                MessageRole::System => Role::System,
                MessageRole::User => Role::User,
                MessageRole::Assistant => Role::Assistant,
            },
            content: match record.content {
                StoredContent::Text(text) => MessageContent::Text(text),
                StoredContent::Structured(value) => MessageContent::Structured(value),
            },
            attachments: record
                .attachments
                .into_iter()
                .map(|attachment| Attachment {
                    content_type: attachment.content_type,
                    url: attachment.url,
                })
                .collect(),
        }
    }
}

pub(crate) fn to_provider_role(role: Role) -> ProviderRole {
    match role {
        Role::System => ProviderRole::System,
        Role::User => ProviderRole::User,
        Role::Assistant => ProviderRole::Assistant,
    }
}

pub(crate) fn to_provider_attachment(attachment: &Attachment) -> ProviderAttachment {
    ProviderAttachment::new(attachment.content_type.clone(), attachment.url.clone())
}

pub(crate) fn to_records(messages: &[Message]) -> Vec<MessageRecord> {
    messages.iter().map(MessageRecord::from).collect()
}
