//! HTML rendering of conversation messages.
//!
//! Within one message the output order is fixed: text, reasoning, sources,
//! attachments, then a single collapsible tool section. Rendering is a pure
//! function of its inputs, so a re-render of an unchanged message is
//! byte-identical and can be swapped in place on the client.

use pulldown_cmark::{CowStr, Event, Options, Parser, Tag, html};

use super::message::{Attachment, Message, ReasoningDetail, Role};
use super::partition::{PartitionedMessage, ReasoningPart, partition};
use super::stream::Conversation;
use super::tools::{ToolViewRegistry, escape, safe_href};

pub struct RenderContext<'a> {
    pub chat_id: &'a str,
    pub tools: &'a ToolViewRegistry,
    pub copied_message: Option<&'a str>,
}

pub fn markdown(text: &str) -> String {
    let options =
        Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;
    let events = Parser::new_ext(text, options).map(|ev| match ev {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        Event::Start(Tag::Link {
            link_type,
            dest_url,
            title,
            id,
        }) if safe_href(&dest_url).is_none() => Event::Start(Tag::Link {
            link_type,
            dest_url: CowStr::Borrowed("#"),
            title,
            id,
        }),
        Event::Start(Tag::Image {
            link_type,
            dest_url,
            title,
            id,
        }) if safe_href(&dest_url).is_none() => Event::Start(Tag::Image {
            link_type,
            dest_url: CowStr::Borrowed(""),
            title,
            id,
        }),
        other => other,
    });
    let mut out = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut out, events);
    out
}

fn render_reasoning(r: &ReasoningPart<'_>) -> String {
    let mut body = String::new();
    if r.details.is_empty() {
        body.push_str(&escape(r.reasoning));
    } else {
        for d in r.details {
            match d {
                ReasoningDetail::Text { text, .. } => body.push_str(&escape(text)),
                ReasoningDetail::Redacted { .. } => body.push_str("<em>[redacted]</em>"),
            }
        }
    }
    format!(
        concat!(
            r#"<details class="part part-reasoning"><summary>Reasoning</summary>"#,
            "<pre>{}</pre></details>"
        ),
        body
    )
}

fn render_attachment(a: &Attachment) -> String {
    let name = a.name.as_deref().unwrap_or("attachment");
    let Some(href) = safe_href(&a.url) else {
        return format!(r#"<div class="part part-attachment">{}</div>"#, escape(name));
    };
    let inner = if a.content_type.as_deref().is_some_and(|t| t.starts_with("image/")) {
        format!(r#"<img src="{}" alt="{}">"#, href, escape(name))
    } else {
        format!(
            r#"<a href="{}" target="_blank" rel="noopener">{}</a>"#,
            href,
            escape(name)
        )
    };
    format!(r#"<div class="part part-attachment">{}</div>"#, inner)
}

fn render_parts(
    message: &Message,
    parts: &PartitionedMessage<'_>,
    tools: &ToolViewRegistry,
) -> String {
    let mut html = String::new();
    for text in &parts.text {
        html.push_str(r#"<div class="part part-text markdown">"#);
        if message.role == Role::User {
            html.push_str(&escape(text));
        } else {
            html.push_str(&markdown(text));
        }
        html.push_str("</div>");
    }
    for r in &parts.reasoning {
        html.push_str(&render_reasoning(r));
    }
    for s in &parts.sources {
        let label = escape(s.title.as_deref().unwrap_or(&s.url)).into_owned();
        match safe_href(&s.url) {
            Some(href) => html.push_str(&format!(
                r#"<a class="part part-source" href="{}" target="_blank" rel="noopener">{}</a>"#,
                href, label
            )),
            None => {
                html.push_str(&format!(r#"<span class="part part-source">{}</span>"#, label))
            }
        }
    }
    for a in &message.attachments {
        html.push_str(&render_attachment(a));
    }
    let cards: Vec<String> = parts.tools.iter().filter_map(|inv| tools.render(inv)).collect();
    if !cards.is_empty() {
        html.push_str(&format!(
            r#"<details class="part part-tools"><summary>Tools used ({})</summary>{}</details>"#,
            cards.len(),
            cards.concat()
        ));
    }
    html
}

pub fn render_message(message: &Message, ctx: &RenderContext<'_>) -> String {
    let parts = partition(message);
    let body = render_parts(message, &parts, ctx.tools);
    let actions = match message.role {
        Role::Assistant => {
            let label = if ctx.copied_message == Some(message.id.as_str()) {
                "Copied"
            } else {
                "Copy"
            };
            format!(
                concat!(
                    r#"<div class="message-actions">"#,
                    r#"<button class="copy" data-copy-url="/chat/{}/copy/{}">{}</button></div>"#
                ),
                escape(ctx.chat_id),
                escape(&message.id),
                label
            )
        }
        Role::User => String::new(),
    };
    format!(
        concat!(
            r#"<article class="message {role}" id="msg-{id}" data-role="{role}">"#,
            "{body}{actions}</article>"
        ),
        role = message.role.as_str(),
        id = escape(&message.id),
        body = body,
        actions = actions
    )
}

pub fn render_conversation(conversation: &Conversation, ctx: &RenderContext<'_>) -> String {
    conversation.messages.iter().map(|m| render_message(m, ctx)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::{Part, Source, ToolInvocation, ToolState};
    use crate::chat::tools::document_search;
    use serde_json::json;

    fn ctx(tools: &ToolViewRegistry) -> RenderContext<'_> {
        RenderContext {
            chat_id: "c1",
            tools,
            copied_message: None,
        }
    }

    fn rich(role: Role) -> Message {
        let mut m = Message::assistant("m1");
        m.role = role;
        m.parts = vec![
            Part::ToolInvocation {
                tool_invocation: ToolInvocation {
                    tool_name: document_search::TOOL_NAME.into(),
                    tool_call_id: "t1".into(),
                    state: ToolState::Result,
                    args: json!({"question": "q"}),
                    result: Some(json!([{"content": "doc"}])),
                },
            },
            Part::Source {
                source: Source {
                    id: "s".into(),
                    url: "https://src".into(),
                    title: Some("Src".into()),
                },
            },
            Part::Reasoning {
                reasoning: "because".into(),
                details: vec![],
            },
            Part::Text {
                text: "**Answer**".into(),
            },
        ];
        m.attachments = vec![Attachment {
            name: Some("scan.png".into()),
            content_type: Some("image/png".into()),
            url: "https://x/scan.png".into(),
        }];
        m
    }

    #[test]
    fn parts_render_in_fixed_order() {
        let tools = ToolViewRegistry::with_default_views();
        let html = render_message(&rich(Role::Assistant), &ctx(&tools));
        let pos = |needle: &str| html.find(needle).unwrap_or_else(|| panic!("missing {}", needle));
        let order = [
            pos("part-text"),
            pos("part-reasoning"),
            pos("part-source"),
            pos("part-attachment"),
            pos("part-tools"),
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}", order);
        assert!(html.contains("<strong>Answer</strong>"));
    }

    #[test]
    fn rerender_is_identical() {
        let tools = ToolViewRegistry::with_default_views();
        let m = rich(Role::Assistant);
        assert_eq!(render_message(&m, &ctx(&tools)), render_message(&m, &ctx(&tools)));
    }

    #[test]
    fn user_messages_hide_reasoning_and_tools() {
        let tools = ToolViewRegistry::with_default_views();
        let html = render_message(&rich(Role::User), &ctx(&tools));
        assert!(!html.contains("part-reasoning"));
        assert!(!html.contains("part-tools"));
        assert!(!html.contains("because"));
        assert!(html.contains("**Answer**"));
        assert!(!html.contains("class=\"copy\""));
    }

    #[test]
    fn unknown_tools_leave_no_section() {
        let tools = ToolViewRegistry::with_default_views();
        let mut m = Message::assistant("m2");
        m.parts = vec![
            Part::Text { text: "hi".into() },
            Part::ToolInvocation {
                tool_invocation: ToolInvocation {
                    tool_name: "weather".into(),
                    tool_call_id: "t".into(),
                    state: ToolState::Call,
                    args: json!({}),
                    result: None,
                },
            },
        ];
        assert!(!render_message(&m, &ctx(&tools)).contains("part-tools"));
    }

    #[test]
    fn markdown_escapes_raw_html_and_script_links() {
        let html = markdown(concat!(
            "<script>alert(1)</script>\n\n",
            "[x](javascript:alert(1)) [ok](https://ok.example)"
        ));
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("javascript:"));
        assert!(html.contains(r#"href="https://ok.example""#));
    }

    #[test]
    fn copy_label_tracks_confirmation() {
        let tools = ToolViewRegistry::with_default_views();
        let m = rich(Role::Assistant);
        let copied = RenderContext { chat_id: "c1", tools: &tools, copied_message: Some("m1") };
        assert!(render_message(&m, &copied).contains(">Copied</button>"));
        assert!(render_message(&m, &ctx(&tools)).contains(">Copy</button>"));
    }
}
