use serde::Deserialize;

use super::{ToolView, escape};
use crate::chat::message::{ToolInvocation, ToolState};

pub const TOOL_NAME: &str = "getInformation";

#[derive(Debug, Deserialize)]
struct Snippet {
    #[serde(default, alias = "content")]
    text: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    similarity: Option<f64>,
}

/// Knowledge-base lookups: question plus the matched document snippets.
pub struct DocumentSearchView;

impl ToolView for DocumentSearchView {
    fn name(&self) -> &'static str {
        TOOL_NAME
    }

    fn render(&self, inv: &ToolInvocation) -> String {
        let question = inv
            .args
            .get("question")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let mut html = format!(
            concat!(
                r#"<div class="tool-card tool-document-search" data-call="{}">"#,
                r#"<div class="tool-title">Document search: {}</div>"#
            ),
            escape(&inv.tool_call_id),
            escape(question)
        );
        match (&inv.state, &inv.result) {
            (ToolState::Result, Some(result)) => {
                let snippets: Vec<Snippet> =
                    serde_json::from_value(result.clone()).unwrap_or_default();
                if snippets.is_empty() {
                    html.push_str(r#"<p class="tool-empty">No matching documents.</p>"#);
                } else {
                    html.push_str("<ol>");
                    for s in snippets {
                        html.push_str("<li>");
                        if let Some(title) = &s.title {
                            html.push_str(&format!("<strong>{}</strong> ", escape(title)));
                        }
                        html.push_str(&escape(&s.text));
                        if let Some(sim) = s.similarity {
                            let percent = sim * 100.0;
                            html.push_str(&format!(
                                r#" <span class="similarity">{:.0}%</span>"#,
                                percent
                            ));
                        }
                        html.push_str("</li>");
                    }
                    html.push_str("</ol>");
                }
            }
            _ => html.push_str(r#"<p class="tool-pending">Searching documents…</p>"#),
        }
        html.push_str("</div>");
        html
    }
}
