use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(Direction {
    Inbound => "inbound",
    Outbound => "outbound",
});

string_enum!(MessageStatus {
    Queued => "queued",
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
    Failed => "failed",
});

impl MessageStatus {
    /// Position on the success path. `Failed` sits outside it.
    pub fn rank(&self) -> u8 {
        match self {
            MessageStatus::Queued => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 0,
        }
    }
}

string_enum!(TemplateStatus {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

impl TemplateStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TemplateStatus::Approved | TemplateStatus::Rejected)
    }

    /// Maps the provider's wider status vocabulary onto the local three states.
    pub fn from_provider(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "APPROVED" => TemplateStatus::Approved,
            "REJECTED" | "DISABLED" => TemplateStatus::Rejected,
            _ => TemplateStatus::Pending,
        }
    }
}

string_enum!(SendPath {
    Free => "free",
    Template => "template",
});

string_enum!(CampaignStatus {
    Draft => "draft",
    Sending => "sending",
    AwaitingTemplate => "awaiting_template",
    Completed => "completed",
    Failed => "failed",
});

string_enum!(DeliveryStatus {
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
    Failed => "failed",
});

impl DeliveryStatus {
    pub fn as_message_status(&self) -> MessageStatus {
        match self {
            DeliveryStatus::Sent => MessageStatus::Sent,
            DeliveryStatus::Delivered => MessageStatus::Delivered,
            DeliveryStatus::Read => MessageStatus::Read,
            DeliveryStatus::Failed => MessageStatus::Failed,
        }
    }
}

string_enum!(MediaFormat {
    Image => "IMAGE",
    Video => "VIDEO",
    Document => "DOCUMENT",
});

impl MediaFormat {
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("image/") {
            MediaFormat::Image
        } else if mime.starts_with("video/") {
            MediaFormat::Video
        } else {
            MediaFormat::Document
        }
    }

    pub fn send_key(&self) -> &'static str {
        match self {
            MediaFormat::Image => "image",
            MediaFormat::Video => "video",
            MediaFormat::Document => "document",
        }
    }
}

pub const HEADER_TEXT_MAX: usize = 60;
pub const FOOTER_TEXT_MAX: usize = 60;
pub const BUTTON_TEXT_MAX: usize = 25;
pub const BUTTONS_MAX: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComponentError {
    #[error("{0} text must not be empty")]
    Empty(&'static str),
    #[error("{kind} text exceeds {max} characters")]
    TooLong { kind: &'static str, max: usize },
    #[error("header media must be a provider media handle, not a URL")]
    RawUrlHandle,
    #[error("button url must start with http:// or https://")]
    InvalidUrl,
    #[error("templates accept between 1 and 10 buttons")]
    ButtonCount,
}

fn checked_text(kind: &'static str, text: &str, max: usize) -> Result<String, ComponentError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ComponentError::Empty(kind));
    }
    if trimmed.chars().count() > max {
        return Err(ComponentError::TooLong { kind, max });
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Header {
    Text { text: String },
    Media { format: MediaFormat, handle: String },
}

impl Header {
    pub fn text(text: &str) -> Result<Self, ComponentError> {
        Ok(Header::Text {
            text: checked_text("header", text, HEADER_TEXT_MAX)?,
        })
    }

    pub fn media(format: MediaFormat, handle: &str) -> Result<Self, ComponentError> {
        let handle = handle.trim();
        if handle.is_empty() {
            return Err(ComponentError::Empty("header media handle"));
        }
        if handle.starts_with("http://") || handle.starts_with("https://") {
            return Err(ComponentError::RawUrlHandle);
        }
        Ok(Header::Media {
            format,
            handle: handle.to_string(),
        })
    }

    /// Identity used for reuse matching. Media headers compare by format only,
    /// since every upload yields a fresh handle.
    pub fn match_key(&self) -> String {
        match self {
            Header::Text { text } => {
                format!("text:{}", crate::templates::dedup::normalize_text(text))
            }
            Header::Media { format, .. } => format!("media:{}", format.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Body {
    text: String,
}

impl Body {
    pub fn new(text: &str) -> Result<Self, ComponentError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ComponentError::Empty("body"));
        }
        Ok(Self {
            text: trimmed.to_string(),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Footer {
    text: String,
}

impl Footer {
    pub fn new(text: &str) -> Result<Self, ComponentError> {
        Ok(Self {
            text: checked_text("footer", text, FOOTER_TEXT_MAX)?,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Button {
    QuickReply { text: String },
    Url { text: String, url: String },
    PhoneNumber { text: String, phone_number: String },
}

impl Button {
    pub fn quick_reply(text: &str) -> Result<Self, ComponentError> {
        Ok(Button::QuickReply {
            text: checked_text("button", text, BUTTON_TEXT_MAX)?,
        })
    }

    pub fn url(text: &str, url: &str) -> Result<Self, ComponentError> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ComponentError::InvalidUrl);
        }
        Ok(Button::Url {
            text: checked_text("button", text, BUTTON_TEXT_MAX)?,
            url: url.to_string(),
        })
    }

    pub fn phone_number(text: &str, phone_number: &str) -> Result<Self, ComponentError> {
        Ok(Button::PhoneNumber {
            text: checked_text("button", text, BUTTON_TEXT_MAX)?,
            phone_number: checked_text("phone number", phone_number, 20)?,
        })
    }

    fn to_json(&self) -> Value {
        match self {
            Button::QuickReply { text } => json!({"type": "QUICK_REPLY", "text": text}),
            Button::Url { text, url } => json!({"type": "URL", "text": text, "url": url}),
            Button::PhoneNumber { text, phone_number } => {
                json!({"type": "PHONE_NUMBER", "text": text, "phone_number": phone_number})
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Buttons {
    buttons: Vec<Button>,
}

impl Buttons {
    pub fn new(buttons: Vec<Button>) -> Result<Self, ComponentError> {
        if buttons.is_empty() || buttons.len() > BUTTONS_MAX {
            return Err(ComponentError::ButtonCount);
        }
        Ok(Self { buttons })
    }

    pub fn as_slice(&self) -> &[Button] {
        &self.buttons
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemplateComponent {
    Header(Header),
    Body(Body),
    Footer(Footer),
    Buttons(Buttons),
}

impl TemplateComponent {
    /// Component payload in the provider's template-creation format.
    pub fn to_creation_json(&self) -> Value {
        match self {
            TemplateComponent::Header(Header::Text { text }) => {
                json!({"type": "HEADER", "format": "TEXT", "text": text})
            }
            TemplateComponent::Header(Header::Media { format, handle }) => json!({
                "type": "HEADER",
                "format": format.as_str(),
                "example": {"header_handle": [handle]},
            }),
            TemplateComponent::Body(body) => json!({"type": "BODY", "text": body.text()}),
            TemplateComponent::Footer(footer) => json!({"type": "FOOTER", "text": footer.text()}),
            TemplateComponent::Buttons(buttons) => json!({
                "type": "BUTTONS",
                "buttons": buttons.as_slice().iter().map(Button::to_json).collect::<Vec<_>>(),
            }),
        }
    }
}

/// Everything that makes up one template's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateContent {
    pub body: Body,
    pub header: Option<Header>,
    pub footer: Option<Footer>,
    pub buttons: Option<Buttons>,
}

impl TemplateContent {
    pub fn body_only(body: Body) -> Self {
        Self {
            body,
            header: None,
            footer: None,
            buttons: None,
        }
    }

    pub fn components(&self) -> Vec<TemplateComponent> {
        let mut out = Vec::with_capacity(4);
        if let Some(header) = &self.header {
            out.push(TemplateComponent::Header(header.clone()));
        }
        out.push(TemplateComponent::Body(self.body.clone()));
        if let Some(footer) = &self.footer {
            out.push(TemplateComponent::Footer(footer.clone()));
        }
        if let Some(buttons) = &self.buttons {
            out.push(TemplateComponent::Buttons(buttons.clone()));
        }
        out
    }

    pub fn creation_json(&self) -> Value {
        Value::Array(
            self.components()
                .iter()
                .map(TemplateComponent::to_creation_json)
                .collect(),
        )
    }
}

/// Runtime parameters attached to a template send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendParameters {
    pub header_media: Option<(MediaFormat, String)>,
}

impl SendParameters {
    pub fn to_json(&self) -> Value {
        let mut components = Vec::new();
        if let Some((format, media_id)) = &self.header_media {
            let key = format.send_key();
            let mut parameter = serde_json::Map::new();
            parameter.insert("type".to_string(), json!(key));
            parameter.insert(key.to_string(), json!({"id": media_id}));
            components.push(json!({
                "type": "header",
                "parameters": [Value::Object(parameter)],
            }));
        }
        Value::Array(components)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderMediaSpec {
    pub url: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub provider_message_id: String,
    pub status: DeliveryStatus,
    pub timestamp: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub provider_message_id: String,
    pub from: String,
    pub text: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateStatusEvent {
    pub provider_template_id: Option<String>,
    pub name: Option<String>,
    pub status: TemplateStatus,
    pub reason: Option<String>,
}
