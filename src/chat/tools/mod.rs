use super::message::ToolInvocation;

pub mod document_search;
pub mod website_search;

/// Renders one kind of tool invocation as an HTML card.
pub trait ToolView: Send + Sync {
    fn name(&self) -> &'static str;
    fn render(&self, invocation: &ToolInvocation) -> String;
}

pub struct ToolViewRegistry {
    views: Vec<Box<dyn ToolView>>,
}

impl Default for ToolViewRegistry {
    fn default() -> Self {
        Self::with_default_views()
    }
}

impl ToolViewRegistry {
    pub fn new() -> Self {
        Self { views: Vec::new() }
    }

    pub fn with_default_views() -> Self {
        let mut r = Self::new();
        r.register(Box::new(document_search::DocumentSearchView));
        r.register(Box::new(website_search::WebsiteSearchView));
        r
    }
    pub fn register(&mut self, v: Box<dyn ToolView>) {
        self.views.push(v);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolView> {
        self.views.iter().map(|b| b.as_ref()).find(|v| v.name() == name)
    }

    /// `None` for tools with no registered view.
    pub fn render(&self, invocation: &ToolInvocation) -> Option<String> {
        match self.get(&invocation.tool_name) {
            Some(view) => Some(view.render(invocation)),
            None => {
                tracing::warn!(
                    tool = %invocation.tool_name,
                    call = %invocation.tool_call_id,
                    "no view for tool, skipping"
                );
                None
            }
        }
    }
}

pub(crate) fn escape(s: &str) -> std::borrow::Cow<'_, str> {
    html_escape::encode_text(s)
}

pub(crate) fn escape_attr(s: &str) -> std::borrow::Cow<'_, str> {
    html_escape::encode_double_quoted_attribute(s)
}

/// Only http(s) links are emitted as hrefs.
pub(crate) fn safe_href(url: &str) -> Option<std::borrow::Cow<'_, str>> {
    let lower = url.trim_start().to_ascii_lowercase();
    (lower.starts_with("http://") || lower.starts_with("https://")).then(|| escape_attr(url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::ToolState;

    fn invocation(name: &str) -> ToolInvocation {
        ToolInvocation {
            tool_name: name.into(),
            tool_call_id: "c1".into(),
            state: ToolState::Call,
            args: serde_json::json!({"question": "dosage", "query": "dosage"}),
            result: None,
        }
    }

    #[test]
    fn routes_by_tool_name() {
        let r = ToolViewRegistry::with_default_views();
        let doc = r.render(&invocation(document_search::TOOL_NAME)).unwrap();
        assert!(doc.contains("tool-document-search"));
        let web = r.render(&invocation(website_search::TOOL_NAME)).unwrap();
        assert!(web.contains("tool-website-search"));
    }

    #[test]
    fn unknown_tool_renders_nothing() {
        let r = ToolViewRegistry::with_default_views();
        assert!(r.render(&invocation("weather")).is_none());
    }
}
