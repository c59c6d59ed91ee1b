use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Form, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, Redirect};
use axum::routing::{get, post};
use axum::{Extension, Json, Router, middleware};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::chat::client::{ChatClient, StreamEnd};
use crate::chat::message::{Message, Role};
use crate::chat::render::{RenderContext, render_conversation};
use crate::chat::stream::{Status, StreamError};
use crate::chat::tools::ToolViewRegistry;
use crate::guard::provider::User;
use crate::guard::{Gate, session_gate};
use crate::session::{ChatEvent, ChatSession, SubscriberGuard};
use crate::settings::{ModelSettings, ModelSettingsPatch};
use crate::storage::ChatRepository;
use crate::templates::{ChatScreen, TemplateEngine};
use crate::ui::{Branding, COPY_CONFIRMATION, Toast, UiState, copy_text};

#[derive(Clone)]
pub struct AppState {
    pub chats: Arc<RwLock<HashMap<String, ChatSession>>>,
    pub repo: Arc<dyn ChatRepository>,
    pub client: ChatClient,
    pub tools: Arc<ToolViewRegistry>,
    pub branding: Arc<Branding>,
    pub templates: Arc<TemplateEngine>,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn ChatRepository>,
        client: ChatClient,
        branding: Branding,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            chats: Arc::new(RwLock::new(HashMap::new())),
            repo,
            client,
            tools: Arc::new(ToolViewRegistry::with_default_views()),
            branding: Arc::new(branding),
            templates: Arc::new(TemplateEngine::new()?),
        })
    }
}

fn internal(e: anyhow::Error) -> StatusCode {
    tracing::error!(error = %e, "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn signed_in(user: Option<Extension<User>>) -> Result<User, StatusCode> {
    user.map(|Extension(u)| u).ok_or(StatusCode::UNAUTHORIZED)
}

fn valid_chat_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Loads the chat into memory if needed. Chats owned by someone else are 404.
async fn open_chat(
    state: &AppState,
    id: &str,
    user: &User,
    user_agent: Option<&str>,
) -> Result<(), StatusCode> {
    if !valid_chat_id(id) {
        return Err(StatusCode::NOT_FOUND);
    }
    if let Some(chat) = state.chats.write().await.get_mut(id) {
        if chat.owner != user.id {
            return Err(StatusCode::NOT_FOUND);
        }
        chat.retain();
        return Ok(());
    }
    let record = state.repo.ensure_chat(id, &user.id).await.map_err(internal)?;
    if record.owner != user.id {
        return Err(StatusCode::NOT_FOUND);
    }
    let history = state.repo.list_messages(id).await.map_err(internal)?;
    let mut chats = state.chats.write().await;
    chats
        .entry(id.to_string())
        .or_insert_with(|| ChatSession::new(record, history, UiState::for_user_agent(user_agent)))
        .retain();
    Ok(())
}

/// Forgets the in-memory session once nobody watches it and nothing is in
/// flight. The next visit rebuilds it from storage.
async fn evict_if_idle(state: &AppState, chat_id: &str) {
    let mut chats = state.chats.write().await;
    if chats.get(chat_id).is_some_and(ChatSession::is_disposable) {
        chats.remove(chat_id);
        tracing::debug!(chat = %chat_id, open = chats.len(), "chat session evicted");
    }
}

fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok())
}

async fn landing(
    State(state): State<AppState>,
    user: Option<Extension<User>>,
) -> Result<Html<String>, StatusCode> {
    let user = user.as_ref().map(|Extension(u)| u);
    state.templates.landing(&state.branding, user).map(Html).map_err(internal)
}

async fn sign_in(State(state): State<AppState>) -> Result<Html<String>, StatusCode> {
    state.templates.sign_in(&state.branding).map(Html).map_err(internal)
}

async fn protected_home(
    State(state): State<AppState>,
    user: Option<Extension<User>>,
) -> Result<Html<String>, StatusCode> {
    let user = signed_in(user)?;
    let chats = state.repo.list_chats(&user.id).await.map_err(internal)?;
    state
        .templates
        .protected_home(&state.branding, &user, &chats)
        .map(Html)
        .map_err(internal)
}

async fn new_chat() -> Redirect {
    Redirect::to(&format!("/chat/{}", Uuid::new_v4()))
}

async fn chat_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    user: Option<Extension<User>>,
) -> Result<Html<String>, StatusCode> {
    let user = signed_in(user)?;
    open_chat(&state, &id, &user, user_agent(&headers)).await?;
    let chats_list = state.repo.list_chats(&user.id).await.map_err(internal)?;
    let chats = state.chats.read().await;
    let chat = chats.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    let ctx = RenderContext {
        chat_id: &id,
        tools: &state.tools,
        copied_message: chat.copy.confirming_message(Instant::now()),
    };
    let messages_html = render_conversation(&chat.conversation, &ctx);
    let screen = ChatScreen {
        chat_id: &id,
        branding: &state.branding,
        ui: &chat.ui,
        settings: &chat.settings,
        chats: &chats_list,
        messages_html: &messages_html,
        streaming: chat.conversation.status == Status::Streaming,
    };
    state.templates.chat_screen(&screen).map(Html).map_err(internal)
}

#[derive(Debug, Deserialize)]
pub struct SubmitForm {
    pub text: String,
}

async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    user: Option<Extension<User>>,
    Form(form): Form<SubmitForm>,
) -> Result<Html<String>, StatusCode> {
    let user = signed_in(user)?;
    let text = form.text.trim();
    if text.is_empty() {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }
    open_chat(&state, &id, &user, user_agent(&headers)).await?;

    let (turn, cancel, user_msg, history, settings, html) = {
        let mut chats = state.chats.write().await;
        let chat = chats.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
        let (turn, cancel) = chat.start_turn();
        let user_msg = chat.conversation.push_user(text).clone();
        let index = chat.conversation.messages.len() - 1;
        let event = chat
            .render_message(index, &state.tools)
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
        let html = event.data();
        chat.publish(event);
        chat.publish(ChatEvent::Status(Status::Streaming));
        let history = chat.conversation.messages.clone();
        (turn, cancel, user_msg, history, chat.settings.current().clone(), html)
    };
    tracing::info!(chat = %id, endpoint = settings.endpoint().path(), "user message submitted");

    if let Err(e) = state.repo.append_message(&id, &user_msg).await {
        tracing::error!(chat = %id, error = %e, "failed to store user message");
    }
    tokio::spawn(run_turn(state.clone(), id, turn, cancel, history, settings));
    Ok(Html(html))
}

/// Streams one assistant turn into the chat and publishes every change.
async fn run_turn(
    state: AppState,
    chat_id: String,
    turn: u64,
    cancel: CancellationToken,
    history: Vec<Message>,
    settings: ModelSettings,
) {
    let (tx, mut rx) = mpsc::channel(64);
    let producer = state.client.stream(
        settings.endpoint(),
        &chat_id,
        &history,
        settings.option.as_deref(),
        &cancel,
        tx,
    );
    let consumer = async {
        while let Some(chunk) = rx.recv().await {
            let mut chats = state.chats.write().await;
            // checked under the lock: a newer turn cancels us while holding it
            if cancel.is_cancelled() {
                return None;
            }
            let Some(chat) = chats.get_mut(&chat_id) else {
                return None;
            };
            match chat.conversation.apply(chunk) {
                Ok(Some(index)) => {
                    if let Some(event) = chat.render_message(index, &state.tools) {
                        chat.publish(event);
                    }
                }
                Ok(None) => {}
                Err(e) => return Some(e),
            }
        }
        None
    };
    let (result, failure) = tokio::join!(producer, consumer);
    let outcome: Result<StreamEnd, StreamError> = match (failure, result) {
        (Some(e), _) | (None, Err(e)) => Err(e),
        (None, Ok(end)) => Ok(end),
    };

    let finalized = {
        let mut chats = state.chats.write().await;
        let Some(chat) = chats.get_mut(&chat_id) else {
            return;
        };
        if !chat.is_current_turn(turn) {
            return;
        }
        chat.end_turn(turn);
        let finalized = match outcome {
            Ok(end) => {
                if end == StreamEnd::Cancelled {
                    tracing::info!(chat = %chat_id, "turn stopped before completion");
                    chat.publish(ChatEvent::Toast(Toast::info("Answer stopped.")));
                }
                chat.conversation.finish()
            }
            Err(e) => {
                let toast = chat.conversation.fail(&e);
                chat.publish(ChatEvent::Toast(toast));
                None
            }
        };
        chat.publish(ChatEvent::Status(Status::Idle));
        finalized
    };
    if let Some(message) = finalized {
        if let Err(e) = state.repo.append_message(&chat_id, &message).await {
            tracing::error!(chat = %chat_id, error = %e, "failed to store assistant message");
        }
    }
    evict_if_idle(&state, &chat_id).await;
}

async fn stop_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: Option<Extension<User>>,
) -> Result<StatusCode, StatusCode> {
    let user = signed_in(user)?;
    let mut chats = state.chats.write().await;
    let chat = chats
        .get_mut(&id)
        .filter(|c| c.owner == user.id)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(if chat.stop() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NO_CONTENT
    })
}

/// One open event stream. Closing it may leave the chat idle and unwatched.
struct Viewer {
    guard: Option<SubscriberGuard>,
    state: AppState,
    chat_id: String,
}

impl Drop for Viewer {
    fn drop(&mut self) {
        // release first so the eviction check sees the viewer gone
        drop(self.guard.take());
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let state = self.state.clone();
            let chat_id = std::mem::take(&mut self.chat_id);
            handle.spawn(async move { evict_if_idle(&state, &chat_id).await });
        }
    }
}

async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    user: Option<Extension<User>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let user = signed_in(user)?;
    open_chat(&state, &id, &user, user_agent(&headers)).await?;
    let (rx, guard) = {
        let mut chats = state.chats.write().await;
        let chat = chats.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
        let sub = chat.subscribe();
        tracing::debug!(chat = %id, viewers = chat.viewers(), "viewer connected");
        sub
    };
    let viewer = Viewer {
        guard: Some(guard),
        state: state.clone(),
        chat_id: id,
    };
    let stream = BroadcastStream::new(rx).filter_map(move |ev| {
        let _viewer = &viewer;
        let out = match ev {
            Ok(ev) => {
                let data = ev.data().replace('\r', "");
                Some(Ok(Event::default().event(ev.name()).data(data)))
            }
            Err(e) => {
                tracing::warn!(error = %e, "viewer fell behind, events dropped");
                None
            }
        };
        std::future::ready(out)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Applies the change for every viewer at once, then persists in the background.
async fn update_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    user: Option<Extension<User>>,
    Form(patch): Form<ModelSettingsPatch>,
) -> Result<Html<String>, StatusCode> {
    let user = signed_in(user)?;
    open_chat(&state, &id, &user, user_agent(&headers)).await?;
    let (save, html) = {
        let mut chats = state.chats.write().await;
        let chat = chats.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
        let mut desired = chat.settings.current().clone();
        desired.apply_patch(patch);
        let ticket = chat.settings.propose(desired.clone());
        let html = state.templates.settings_form(&id, &chat.settings);
        if let Ok(html) = &html {
            chat.publish(ChatEvent::Settings { html: html.clone() });
        }
        let save = SettingsSave {
            chat_id: id,
            ticket,
            desired,
            order: chat.save_order(),
            cancel: chat.persist_token(),
        };
        (save, html)
    };
    tokio::spawn(persist_settings(state.clone(), save));
    html.map(Html).map_err(internal)
}

struct SettingsSave {
    chat_id: String,
    ticket: u64,
    desired: ModelSettings,
    order: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

/// Writes the proposal unless a newer one exists by the time it is this
/// save's turn. Returns whether anything was written.
async fn write_settings(state: &AppState, save: &SettingsSave) -> anyhow::Result<bool> {
    let _in_order = save.order.lock().await;
    let latest = state
        .chats
        .read()
        .await
        .get(&save.chat_id)
        .is_some_and(|c| c.settings.is_latest(save.ticket));
    if !latest {
        return Ok(false);
    }
    state.repo.update_settings(&save.chat_id, &save.desired).await?;
    Ok(true)
}

async fn persist_settings(state: AppState, save: SettingsSave) {
    let result = tokio::select! {
        r = write_settings(&state, &save) => Some(r),
        _ = save.cancel.cancelled() => None,
    };
    // an aborted write may still have landed
    let stored = match result {
        Some(_) => None,
        None => match state.repo.get_settings(&save.chat_id).await {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(chat = %save.chat_id, error = %e, "could not re-read settings");
                None
            }
        },
    };

    let chat_id = &save.chat_id;
    let ticket = save.ticket;
    {
        let mut chats = state.chats.write().await;
        let Some(chat) = chats.get_mut(chat_id) else {
            return;
        };
        match result {
            Some(Ok(true)) => {
                chat.settings.confirm(ticket, save.desired);
                tracing::debug!(chat = %chat_id, ticket, "settings saved");
            }
            Some(Ok(false)) => {
                tracing::debug!(chat = %chat_id, ticket, "settings superseded before saving");
                return;
            }
            Some(Err(e)) => {
                tracing::warn!(chat = %chat_id, error = %e, "settings not saved, rolling back");
                chat.settings.rollback(ticket);
                let toast = Toast::error("Your settings could not be saved.");
                chat.publish(ChatEvent::Toast(toast));
            }
            None if stored.as_ref() == Some(&save.desired) => {
                tracing::debug!(chat = %chat_id, ticket, "settings save aborted after writing");
                chat.settings.confirm(ticket, save.desired);
            }
            None => {
                tracing::debug!(chat = %chat_id, ticket, "settings save aborted");
                chat.settings.rollback(ticket);
            }
        }
        match state.templates.settings_form(chat_id, &chat.settings) {
            Ok(html) => chat.publish(ChatEvent::Settings { html }),
            Err(e) => tracing::error!(chat = %chat_id, error = %e, "settings form failed"),
        }
    }
    evict_if_idle(&state, chat_id).await;
}

async fn toggle_ui(
    state: &AppState,
    id: &str,
    user: Option<Extension<User>>,
    apply: impl FnOnce(&mut UiState),
) -> Result<Redirect, StatusCode> {
    let user = signed_in(user)?;
    let mut chats = state.chats.write().await;
    let chat = chats
        .get_mut(id)
        .filter(|c| c.owner == user.id)
        .ok_or(StatusCode::NOT_FOUND)?;
    apply(&mut chat.ui);
    Ok(Redirect::to(&format!("/chat/{}", id)))
}

async fn toggle_theme(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: Option<Extension<User>>,
) -> Result<Redirect, StatusCode> {
    toggle_ui(&state, &id, user, UiState::toggle_theme).await
}

async fn toggle_sidebar(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: Option<Extension<User>>,
) -> Result<Redirect, StatusCode> {
    toggle_ui(&state, &id, user, UiState::toggle_sidebar).await
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CopyResponse {
    pub text: String,
    pub confirm_ms: u64,
}

async fn copy_message(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
    user: Option<Extension<User>>,
) -> Result<Json<CopyResponse>, StatusCode> {
    let user = signed_in(user)?;
    let text = {
        let mut chats = state.chats.write().await;
        let chat = chats
            .get_mut(&id)
            .filter(|c| c.owner == user.id)
            .ok_or(StatusCode::NOT_FOUND)?;
        let index = chat.index_of(&message_id).ok_or(StatusCode::NOT_FOUND)?;
        let message = &chat.conversation.messages[index];
        if message.role != Role::Assistant {
            return Err(StatusCode::NOT_FOUND);
        }
        let text = copy_text(message);
        chat.copy.trigger(&message_id, Instant::now());
        if let Some(event) = chat.render_message(index, &state.tools) {
            chat.publish(event);
        }
        text
    };

    let revert = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(COPY_CONFIRMATION).await;
        let chats = revert.chats.read().await;
        if let Some(chat) = chats.get(&id) {
            let event = chat
                .index_of(&message_id)
                .and_then(|i| chat.render_message(i, &revert.tools));
            if let Some(event) = event {
                chat.publish(event);
            }
        }
    });
    Ok(Json(CopyResponse {
        text,
        confirm_ms: COPY_CONFIRMATION.as_millis() as u64,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn router(state: AppState, gate: Gate) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/sign-in", get(sign_in))
        .route("/protected", get(protected_home))
        .route("/chat", get(new_chat))
        .route("/chat/:id", get(chat_page))
        .route("/chat/:id/messages", post(post_message))
        .route("/chat/:id/stop", post(stop_turn))
        .route("/chat/:id/events", get(events))
        .route("/chat/:id/settings", post(update_settings))
        .route("/chat/:id/ui/theme", post(toggle_theme))
        .route("/chat/:id/ui/sidebar", post(toggle_sidebar))
        .route("/chat/:id/copy/:message_id", post(copy_message))
        .route("/api/healthz", get(health))
        .layer(middleware::from_fn_with_state(gate, session_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState, gate: Gate) -> anyhow::Result<()> {
    let app = router(state, gate);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
