use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

use crate::chat::message::Message;
use crate::chat::render::{RenderContext, render_message};
use crate::chat::stream::{Conversation, Status};
use crate::chat::tools::ToolViewRegistry;
use crate::settings::OptimisticSettings;
use crate::storage::ChatRecord;
use crate::ui::{CopyFeedback, Toast, UiState};

/// Pushed to every open chat screen over SSE.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Message { id: String, html: String },
    Status(Status),
    Toast(Toast),
    Settings { html: String },
    /// The element with this message id leaves the screen.
    Removed { id: String },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Message { .. } => "message",
            ChatEvent::Status(_) => "status",
            ChatEvent::Toast(_) => "toast",
            ChatEvent::Settings { .. } => "settings",
            ChatEvent::Removed { .. } => "remove",
        }
    }

    pub fn data(&self) -> String {
        match self {
            ChatEvent::Message { html, .. } | ChatEvent::Settings { html } => html.clone(),
            ChatEvent::Status(s) => s.as_str().to_string(),
            ChatEvent::Toast(t) => serde_json::to_string(t).unwrap_or_else(|_| t.text.clone()),
            ChatEvent::Removed { id } => format!("msg-{}", id),
        }
    }
}

/// Live state of one open chat.
pub struct ChatSession {
    pub id: String,
    pub owner: String,
    pub conversation: Conversation,
    pub settings: OptimisticSettings,
    pub ui: UiState,
    pub copy: CopyFeedback,
    events: broadcast::Sender<ChatEvent>,
    subscribers: Arc<AtomicUsize>,
    teardown: CancellationToken,
    stream: Option<CancellationToken>,
    turn: u64,
    saves: Arc<Mutex<()>>,
}

/// Held by an SSE connection. The last one to drop aborts in-flight work.
pub struct SubscriberGuard {
    chat: String,
    count: Arc<AtomicUsize>,
    teardown: CancellationToken,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            tracing::debug!(chat = %self.chat, "last viewer left, aborting in-flight work");
            self.teardown.cancel();
        }
    }
}

impl ChatSession {
    pub fn new(record: ChatRecord, history: Vec<Message>, ui: UiState) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            conversation: Conversation::with_history(record.id.clone(), history),
            settings: OptimisticSettings::new(record.settings),
            id: record.id,
            owner: record.owner,
            ui,
            copy: CopyFeedback::default(),
            events,
            subscribers: Arc::new(AtomicUsize::new(0)),
            teardown: CancellationToken::new(),
            stream: None,
            turn: 0,
            saves: Arc::new(Mutex::new(())),
        }
    }

    pub fn publish(&self, event: ChatEvent) {
        // no receivers is fine: nobody is watching this chat right now
        let _ = self.events.send(event);
    }

    fn live_root(&mut self) -> CancellationToken {
        if self.teardown.is_cancelled() {
            self.teardown = CancellationToken::new();
        }
        self.teardown.clone()
    }

    pub fn subscribe(&mut self) -> (broadcast::Receiver<ChatEvent>, SubscriberGuard) {
        let teardown = self.live_root();
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        let guard = SubscriberGuard {
            chat: self.id.clone(),
            count: self.subscribers.clone(),
            teardown,
        };
        (self.events.subscribe(), guard)
    }

    /// Keeps the session in memory until its next viewer leaves.
    pub fn retain(&mut self) {
        self.live_root();
    }

    pub fn viewers(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Cancels any in-flight turn and hands out the token for a new one. The
    /// answer the old turn was writing is dropped from the conversation.
    pub fn start_turn(&mut self) -> (u64, CancellationToken) {
        if let Some(old) = self.stream.take() {
            old.cancel();
        }
        if let Some(id) = self.conversation.abandon() {
            tracing::debug!(chat = %self.id, message = %id, "superseded answer dropped");
            self.publish(ChatEvent::Removed { id });
        }
        self.turn += 1;
        let token = self.live_root().child_token();
        self.stream = Some(token.clone());
        (self.turn, token)
    }

    pub fn is_current_turn(&self, turn: u64) -> bool {
        self.turn == turn
    }

    pub fn stop(&mut self) -> bool {
        match self.stream.take() {
            Some(t) => {
                t.cancel();
                true
            }
            None => false,
        }
    }

    pub fn end_turn(&mut self, turn: u64) {
        if self.turn == turn {
            self.stream = None;
        }
    }

    pub fn persist_token(&mut self) -> CancellationToken {
        self.live_root().child_token()
    }

    /// Held while settings are written so that saves reach storage one at a time.
    pub fn save_order(&self) -> Arc<Mutex<()>> {
        self.saves.clone()
    }

    /// Nobody is watching and nothing is in flight, so the session can be
    /// rebuilt from storage on the next visit.
    pub fn is_disposable(&self) -> bool {
        self.teardown.is_cancelled()
            && self.viewers() == 0
            && self.stream.is_none()
            && !self.settings.is_pending()
    }

    pub fn render_message(&self, index: usize, tools: &ToolViewRegistry) -> Option<ChatEvent> {
        let message = self.conversation.messages.get(index)?;
        let ctx = RenderContext {
            chat_id: &self.id,
            tools,
            copied_message: self.copy.confirming_message(Instant::now()),
        };
        Some(ChatEvent::Message {
            id: message.id.clone(),
            html: render_message(message, &ctx),
        })
    }

    pub fn index_of(&self, message_id: &str) -> Option<usize> {
        self.conversation.messages.iter().position(|m| m.id == message_id)
    }
}
