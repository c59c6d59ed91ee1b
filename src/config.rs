use std::env;

use anyhow::Context;
use url::Url;

use crate::guard::MatcherVariant;
use crate::ui::BrandingPreset;

#[derive(Debug, Clone)]
pub struct Config {
    // identity provider
    pub auth_url: String,
    pub auth_anon_key: Option<String>,
    pub cookie_prefix: String,
    pub sign_in_path: String,

    // upstream chat API
    pub upstream_url: String,

    pub database_url: Option<String>,
    pub branding: BrandingPreset,
    pub matcher: MatcherVariant,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_url: "http://127.0.0.1:54321".into(),
            auth_anon_key: None,
            cookie_prefix: "sb".into(),
            sign_in_path: "/sign-in".into(),
            upstream_url: "http://127.0.0.1:3000".into(),
            database_url: None,
            branding: BrandingPreset::default(),
            matcher: MatcherVariant::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let non_empty = |k: &str| get(k).filter(|v| !v.trim().is_empty());
        Self {
            auth_url: non_empty("MEDASSIST_AUTH_URL").unwrap_or(d.auth_url),
            auth_anon_key: non_empty("MEDASSIST_AUTH_ANON_KEY"),
            cookie_prefix: non_empty("MEDASSIST_COOKIE_PREFIX").unwrap_or(d.cookie_prefix),
            sign_in_path: non_empty("MEDASSIST_SIGN_IN_PATH").unwrap_or(d.sign_in_path),
            upstream_url: non_empty("MEDASSIST_UPSTREAM_URL").unwrap_or(d.upstream_url),
            database_url: non_empty("MEDASSIST_DATABASE_URL"),
            ..d
        }
    }

    /// Rejects URLs and paths the server could never use.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [("auth url", &self.auth_url), ("upstream url", &self.upstream_url)] {
            let url = Url::parse(value).with_context(|| format!("invalid {}: {}", name, value))?;
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("{} must be http or https: {}", name, value);
            }
        }
        if !self.sign_in_path.starts_with('/') {
            anyhow::bail!("sign-in path must start with '/': {}", self.sign_in_path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_defaults_and_ignores_blanks() {
        let vars: HashMap<&str, &str> = [
            ("MEDASSIST_UPSTREAM_URL", "https://chat.example"),
            ("MEDASSIST_AUTH_ANON_KEY", "anon"),
            ("MEDASSIST_SIGN_IN_PATH", "  "),
        ]
        .into_iter()
        .collect();
        let c = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.upstream_url, "https://chat.example");
        assert_eq!(c.auth_anon_key.as_deref(), Some("anon"));
        assert_eq!(c.sign_in_path, "/sign-in");
        assert_eq!(c.cookie_prefix, "sb");
        assert_eq!(c.database_url, None);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let bad_scheme = Config { upstream_url: "ftp://files.example".into(), ..Config::default() };
        assert!(bad_scheme.validate().is_err());
        let not_a_url = Config { auth_url: "localhost".into(), ..Config::default() };
        assert!(not_a_url.validate().is_err());
        let relative = Config { sign_in_path: "sign-in".into(), ..Config::default() };
        assert!(relative.validate().is_err());
    }
}
