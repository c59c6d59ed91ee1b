#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Chat,
    Perplexity,
    Website,
}

impl Endpoint {
    /// Unknown or unset model types use the default chat endpoint.
    pub fn for_model_type(model_type: Option<&str>) -> Self {
        match model_type {
            Some("perplex") => Endpoint::Perplexity,
            Some("website") => Endpoint::Website,
            _ => Endpoint::Chat,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Chat => "/api/chat",
            Endpoint::Perplexity => "/api/perplexity",
            Endpoint::Website => "/api/websitechat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_type_selects_endpoint() {
        assert_eq!(Endpoint::for_model_type(Some("perplex")).path(), "/api/perplexity");
        assert_eq!(Endpoint::for_model_type(Some("website")).path(), "/api/websitechat");
        assert_eq!(Endpoint::for_model_type(Some("gpt")).path(), "/api/chat");
        assert_eq!(Endpoint::for_model_type(Some("")).path(), "/api/chat");
        assert_eq!(Endpoint::for_model_type(None).path(), "/api/chat");
    }
}
