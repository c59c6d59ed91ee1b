use serde::Deserialize;
use serde_json::Value;

use super::{ToolView, escape, safe_href};
use crate::chat::message::{ToolInvocation, ToolState};

pub const TOOL_NAME: &str = "searchWebsite";

#[derive(Debug, Deserialize)]
struct Hit {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
}

// Accepts either a bare list of hits or `{ "results": [...] }`.
fn hits(result: &Value) -> Vec<Hit> {
    let list = result.get("results").unwrap_or(result);
    serde_json::from_value(list.clone()).unwrap_or_default()
}

pub struct WebsiteSearchView;

impl ToolView for WebsiteSearchView {
    fn name(&self) -> &'static str {
        TOOL_NAME
    }

    fn render(&self, inv: &ToolInvocation) -> String {
        let query = inv.args.get("query").and_then(|v| v.as_str()).unwrap_or_default();
        let mut html = format!(
            concat!(
                r#"<div class="tool-card tool-website-search" data-call="{}">"#,
                r#"<div class="tool-title">Website search: {}</div>"#
            ),
            escape(&inv.tool_call_id),
            escape(query)
        );
        match (&inv.state, &inv.result) {
            (ToolState::Result, Some(result)) => {
                let hits = hits(result);
                if hits.is_empty() {
                    html.push_str(r#"<p class="tool-empty">No pages found.</p>"#);
                } else {
                    html.push_str("<ul>");
                    for h in hits {
                        let label = h.title.as_deref().unwrap_or(&h.url);
                        match safe_href(&h.url) {
                            Some(href) => html.push_str(&format!(
                                r#"<li><a href="{}" target="_blank" rel="noopener">{}</a>"#,
                                href,
                                escape(label)
                            )),
                            None => html.push_str(&format!("<li>{}", escape(label))),
                        }
                        if let Some(snippet) = &h.snippet {
                            html.push_str(&format!("<p>{}</p>", escape(snippet)));
                        }
                        html.push_str("</li>");
                    }
                    html.push_str("</ul>");
                }
            }
            _ => html.push_str(r#"<p class="tool-pending">Searching the website…</p>"#),
        }
        html.push_str("</div>");
        html
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_wrapped_and_bare_results() {
        let wrapped = json!({"results": [{"url": "https://a", "title": "A"}]});
        let bare = json!([{"url": "https://b", "snippet": "s"}]);
        assert_eq!(hits(&wrapped).len(), 1);
        assert_eq!(hits(&bare)[0].snippet.as_deref(), Some("s"));
        assert!(hits(&json!("garbage")).is_empty());
    }

    #[test]
    fn links_fall_back_to_url_label() {
        let inv = ToolInvocation {
            tool_name: TOOL_NAME.into(),
            tool_call_id: "c2".into(),
            state: ToolState::Result,
            args: json!({"query": "clinic hours"}),
            result: Some(json!([{"url": "https://clinic.example/hours?a=1&b=2"}])),
        };
        let html = WebsiteSearchView.render(&inv);
        assert!(html.contains(r#"href="https://clinic.example/hours?a=1&amp;b=2""#));
        assert!(html.contains(">https://clinic.example/hours?a=1&amp;b=2</a>"));
    }

    #[test]
    fn script_urls_are_not_linked() {
        let inv = ToolInvocation {
            tool_name: TOOL_NAME.into(),
            tool_call_id: "c3".into(),
            state: ToolState::Result,
            args: json!({"query": "x"}),
            result: Some(json!([{"url": "javascript:alert(1)", "title": "bad"}])),
        };
        let html = WebsiteSearchView.render(&inv);
        assert!(!html.contains("href="));
        assert!(html.contains("<li>bad"));
    }
}
