//! Full-page HTML rendered with MiniJinja. Message fragments come from
//! `chat::render` and are inserted as-is; everything else is autoescaped.

use anyhow::Result;
use minijinja::{Environment, Value, context};
use serde::Serialize;

use crate::guard::provider::User;
use crate::settings::OptimisticSettings;
use crate::storage::ChatRecord;
use crate::ui::{Branding, UiState};

const SOURCES: [(&str, &str); 9] = [
    ("layout.html", include_str!("../templates/layout.html")),
    ("app.css", include_str!("../templates/app.css")),
    ("app.js", include_str!("../templates/app.js")),
    ("landing.html", include_str!("../templates/landing.html")),
    ("sign_in.html", include_str!("../templates/sign_in.html")),
    ("protected.html", include_str!("../templates/protected.html")),
    ("chat_links.html", include_str!("../templates/chat_links.html")),
    ("settings.html", include_str!("../templates/settings.html")),
    ("chat.html", include_str!("../templates/chat.html")),
];

#[derive(Debug, Serialize)]
struct Choice {
    value: &'static str,
    label: &'static str,
}

const MODEL_TYPES: [Choice; 3] = [
    Choice {
        value: "",
        label: "Clinic documents",
    },
    Choice {
        value: "perplex",
        label: "Web research",
    },
    Choice {
        value: "website",
        label: "Clinic website",
    },
];

const OPTIONS: [Choice; 2] = [
    Choice {
        value: "",
        label: "Concise",
    },
    Choice {
        value: "detailed",
        label: "Detailed",
    },
];

#[derive(Debug, Serialize)]
struct SettingsField<'a> {
    name: &'static str,
    choices: &'static [Choice],
    current: &'a str,
}

fn settings_fields(settings: &OptimisticSettings) -> [SettingsField<'_>; 2] {
    let current = settings.current();
    [
        SettingsField {
            name: "model_type",
            choices: &MODEL_TYPES,
            current: current.model_type.as_deref().unwrap_or(""),
        },
        SettingsField {
            name: "option",
            choices: &OPTIONS,
            current: current.option.as_deref().unwrap_or(""),
        },
    ]
}

pub struct ChatScreen<'a> {
    pub chat_id: &'a str,
    pub branding: &'a Branding,
    pub ui: &'a UiState,
    pub settings: &'a OptimisticSettings,
    pub chats: &'a [ChatRecord],
    pub messages_html: &'a str,
    pub streaming: bool,
}

pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_debug(cfg!(debug_assertions));
        for (name, source) in SOURCES {
            env.add_template(name, source)?;
        }
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        Ok(template.render(ctx)?)
    }

    pub fn landing(&self, branding: &Branding, user: Option<&User>) -> Result<String> {
        self.render(
            "landing.html",
            context! {
                branding,
                signed_in => user.is_some(),
            },
        )
    }

    pub fn sign_in(&self, branding: &Branding) -> Result<String> {
        self.render("sign_in.html", context! { branding })
    }

    pub fn protected_home(
        &self,
        branding: &Branding,
        user: &User,
        chats: &[ChatRecord],
    ) -> Result<String> {
        self.render(
            "protected.html",
            context! {
                branding,
                chats,
                who => user.email.as_deref().unwrap_or(&user.id),
            },
        )
    }

    /// The settings form alone, as pushed to every viewer after a change.
    pub fn settings_form(&self, chat_id: &str, settings: &OptimisticSettings) -> Result<String> {
        self.render(
            "settings.html",
            context! {
                chat_id,
                settings_fields => settings_fields(settings),
                saving => settings.is_pending(),
            },
        )
    }

    /// The one chat screen. Branding decides copy, prompts and the input control.
    pub fn chat_screen(&self, s: &ChatScreen<'_>) -> Result<String> {
        self.render(
            "chat.html",
            context! {
                chat_id => s.chat_id,
                branding => s.branding,
                ui => s.ui,
                theme => s.ui.theme.as_str(),
                chats => s.chats,
                active => s.chat_id,
                settings_fields => settings_fields(s.settings),
                saving => s.settings.is_pending(),
                messages_html => s.messages_html,
                streaming => s.streaming,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ModelSettings;
    use crate::ui::Theme;
    use chrono::Utc;

    fn screen<'a>(
        branding: &'a Branding,
        ui: &'a UiState,
        settings: &'a OptimisticSettings,
        messages_html: &'a str,
    ) -> ChatScreen<'a> {
        ChatScreen {
            chat_id: "c1",
            branding,
            ui,
            settings,
            chats: &[],
            messages_html,
            streaming: false,
        }
    }

    #[test]
    fn chat_screen_has_exactly_one_composer() {
        let engine = TemplateEngine::new().unwrap();
        let b = Branding::medical();
        let ui = UiState::default();
        let st = OptimisticSettings::default();
        let html = engine.chat_screen(&screen(&b, &ui, &st, "")).unwrap();
        assert_eq!(html.matches(r#"id="composer""#).count(), 1);
        assert_eq!(html.matches(r#"name="text""#).count(), 1);
        assert!(html.contains("<textarea"));
        assert!(html.contains(r#"class="suggestion""#));
        assert!(html.contains(r#"<body class="light">"#));
        assert!(html.contains(r#"<button type="button" id="stop" hidden>"#));
    }

    #[test]
    fn branding_changes_input_and_copy() {
        let engine = TemplateEngine::new().unwrap();
        let b = Branding::generic();
        let ui = UiState {
            theme: Theme::Dark,
            ..UiState::default()
        };
        let st = OptimisticSettings::default();
        let html = engine
            .chat_screen(&screen(&b, &ui, &st, r#"<article id="msg-1"></article>"#))
            .unwrap();
        assert!(html.contains(r#"<input name="text""#));
        assert!(!html.contains(r#"class="empty""#));
        assert!(html.contains(r#"<body class="dark">"#));
        assert!(html.contains(r#"<article id="msg-1"></article>"#));
    }

    #[test]
    fn settings_form_reflects_pending_value() {
        let engine = TemplateEngine::new().unwrap();
        let mut st = OptimisticSettings::default();
        st.propose(ModelSettings {
            model_type: Some("website".into()),
            option: None,
        });
        let html = engine.settings_form("c1", &st).unwrap();
        assert!(html.starts_with(r#"<form id="settings""#));
        assert!(html.contains(r#"<option value="website" selected>"#));
        assert!(html.contains(r#"<option value="" selected>Concise</option>"#));
        assert!(html.contains("Saving"));
    }

    #[test]
    fn chat_titles_are_escaped_and_the_open_chat_is_marked() {
        let engine = TemplateEngine::new().unwrap();
        let b = Branding::medical();
        let ui = UiState::default();
        let st = OptimisticSettings::default();
        let chats = vec![
            ChatRecord {
                id: "c1".into(),
                owner: "u1".into(),
                title: Some("<script>alert(1)</script>".into()),
                created_at: Utc::now(),
                settings: ModelSettings::default(),
            },
            ChatRecord {
                id: "c2".into(),
                owner: "u1".into(),
                title: None,
                created_at: Utc::now(),
                settings: ModelSettings::default(),
            },
        ];
        let mut s = screen(&b, &ui, &st, "");
        s.chats = &chats;
        let html = engine.chat_screen(&s).unwrap();
        assert!(!html.contains("<script>alert(1)"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains(r#"<li class="active"><a href="/chat/c1">"#));
        assert!(html.contains(">Untitled chat</a>"));
    }

    #[test]
    fn landing_points_signed_in_users_at_the_assistant() {
        let engine = TemplateEngine::new().unwrap();
        let b = Branding::medical();
        let user = User {
            id: "u1".into(),
            email: Some("a@clinic.test".into()),
        };
        let html = engine.landing(&b, Some(&user)).unwrap();
        assert!(html.contains(r#"href="/chat""#));
        let html = engine.landing(&b, None).unwrap();
        assert!(html.contains(r#"href="/sign-in""#));
        let html = engine.protected_home(&b, &user, &[]).unwrap();
        assert!(html.contains("a@clinic.test"));
        assert!(engine.sign_in(&b).unwrap().contains("<title>Sign in</title>"));
    }
}
