use std::time::{Duration, Instant};

use serde::Serialize;

use crate::chat::message::Message;

pub const COPY_CONFIRMATION: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Info,
    Error,
}

/// Transient notification pushed to the chat screen.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Toast {
    pub level: ToastLevel,
    pub text: String,
}

impl Toast {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: ToastLevel::Info,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: ToastLevel::Error,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn toggle(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

/// Per-chat view state. Handed to the renderer explicitly.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UiState {
    pub sidebar_open: bool,
    pub theme: Theme,
    pub is_mobile: bool,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            sidebar_open: true,
            theme: Theme::Light,
            is_mobile: false,
        }
    }
}

impl UiState {
    pub fn for_user_agent(user_agent: Option<&str>) -> Self {
        let is_mobile = user_agent.is_some_and(|ua| ua.contains("Mobi") || ua.contains("Android"));
        Self {
            sidebar_open: !is_mobile,
            is_mobile,
            ..Self::default()
        }
    }

    pub fn toggle_sidebar(&mut self) {
        self.sidebar_open = !self.sidebar_open;
    }

    pub fn toggle_theme(&mut self) {
        self.theme = self.theme.toggle();
    }
}

/// Exactly the text content of a message, nothing else.
pub fn copy_text(message: &Message) -> String {
    message.text()
}

/// "Copied" indicator. Re-triggering while it shows does not extend it.
#[derive(Debug, Clone, Default)]
pub struct CopyFeedback {
    message_id: Option<String>,
    started: Option<Instant>,
}

impl CopyFeedback {
    pub fn trigger(&mut self, message_id: &str, now: Instant) {
        if self.is_confirming(now) {
            return;
        }
        self.message_id = Some(message_id.to_string());
        self.started = Some(now);
    }

    pub fn is_confirming(&self, now: Instant) -> bool {
        self.started.is_some_and(|s| now.saturating_duration_since(s) < COPY_CONFIRMATION)
    }

    pub fn confirming_message(&self, now: Instant) -> Option<&str> {
        if self.is_confirming(now) {
            self.message_id.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BrandingPreset {
    #[default]
    Medical,
    Generic,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputStyle {
    Input,
    Textarea,
}

/// Content that used to differ between copies of the chat screen.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Branding {
    pub title: String,
    pub tagline: String,
    pub placeholder: String,
    pub suggested_prompts: Vec<String>,
    pub input_style: InputStyle,
}

impl Branding {
    pub fn medical() -> Self {
        Self {
            title: "MedAssist".into(),
            tagline: "Answers grounded in your clinic's documents. \
                      Not a substitute for professional medical advice."
                .into(),
            placeholder: "Ask about symptoms, medication, or clinic services…".into(),
            suggested_prompts: vec![
                "What are the side effects of ibuprofen?".into(),
                "What are the clinic's opening hours?".into(),
                "How should I prepare for a blood test?".into(),
            ],
            input_style: InputStyle::Textarea,
        }
    }

    pub fn generic() -> Self {
        Self {
            title: "Assistant".into(),
            tagline: "Ask anything.".into(),
            placeholder: "Send a message…".into(),
            suggested_prompts: Vec::new(),
            input_style: InputStyle::Input,
        }
    }

    pub fn from_preset(preset: BrandingPreset) -> Self {
        match preset {
            BrandingPreset::Medical => Self::medical(),
            BrandingPreset::Generic => Self::generic(),
        }
    }
}
