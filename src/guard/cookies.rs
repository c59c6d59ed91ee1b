use axum::http::{HeaderMap, HeaderValue, header};

/// A cookie the identity provider asked us to write back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub max_age: Option<i64>,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), max_age: None }
    }

    pub fn removal(name: impl Into<String>) -> Self {
        Self { name: name.into(), value: String::new(), max_age: Some(0) }
    }

    pub fn header_value(&self) -> String {
        let mut s = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", self.name, self.value);
        if let Some(age) = self.max_age {
            s.push_str(&format!("; Max-Age={}", age));
        }
        s
    }
}

/// Request-scoped cookie jar. Reads come from the inbound `Cookie` header,
/// writes are recorded so they can be mirrored onto the request and the response.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: Vec<(String, String)>,
    pending: Vec<SetCookie>,
}

impl CookieJar {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut jar = Self::default();
        for value in headers.get_all(header::COOKIE) {
            if let Ok(raw) = value.to_str() {
                jar.cookies.extend(parse_cookie_header(raw));
            }
        }
        jar
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, cookie: SetCookie) {
        self.cookies.retain(|(n, _)| n != &cookie.name);
        if cookie.max_age != Some(0) {
            self.cookies.push((cookie.name.clone(), cookie.value.clone()));
        }
        self.pending.retain(|c| c.name != cookie.name);
        self.pending.push(cookie);
    }

    pub fn pending(&self) -> &[SetCookie] {
        &self.pending
    }

    /// Rebuilds the inbound `Cookie` header so downstream handlers see refreshed tokens.
    pub fn write_request_headers(&self, headers: &mut HeaderMap) {
        if self.pending.is_empty() {
            return;
        }
        headers.remove(header::COOKIE);
        let joined = self
            .cookies
            .iter()
            .map(|(n, v)| format!("{}={}", n, v))
            .collect::<Vec<_>>()
            .join("; ");
        if joined.is_empty() {
            return;
        }
        match HeaderValue::from_str(&joined) {
            Ok(v) => { headers.insert(header::COOKIE, v); }
            Err(e) => tracing::warn!(error = %e, "dropping unencodable cookie header"),
        }
    }

    pub fn write_response_headers(&self, headers: &mut HeaderMap) {
        for cookie in &self.pending {
            match HeaderValue::from_str(&cookie.header_value()) {
                Ok(v) => {
                    headers.append(header::SET_COOKIE, v);
                }
                Err(e) => {
                    let name = cookie.name.as_str();
                    tracing::warn!(cookie = name, error = %e, "dropping unencodable set-cookie")
                }
            }
        }
    }
}

fn parse_cookie_header(raw: &str) -> impl Iterator<Item = (String, String)> + '_ {
    raw.split(';').filter_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some((name.to_string(), value.trim().trim_matches('"').to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(cookie: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::COOKIE, HeaderValue::from_str(cookie).unwrap());
        h
    }

    #[test]
    fn parses_cookie_header() {
        let jar = CookieJar::from_headers(&headers_with("a=1; sb-access-token=xyz; empty="));
        assert_eq!(jar.get("a"), Some("1"));
        assert_eq!(jar.get("sb-access-token"), Some("xyz"));
        assert_eq!(jar.get("empty"), Some(""));
        assert_eq!(jar.get("missing"), None);
        assert!(jar.pending().is_empty());
    }

    #[test]
    fn writes_are_mirrored_to_request_and_response() {
        let mut jar = CookieJar::from_headers(&headers_with("keep=1; tok=old"));
        jar.set(SetCookie::new("tok", "new"));
        jar.set(SetCookie::removal("keep"));

        let mut req = headers_with("keep=1; tok=old");
        jar.write_request_headers(&mut req);
        assert_eq!(req.get(header::COOKIE).unwrap(), "tok=new");

        let mut resp = HeaderMap::new();
        jar.write_response_headers(&mut resp);
        let set: Vec<_> = resp
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(set.len(), 2);
        assert!(set[0].starts_with("tok=new;"));
        assert!(set[1].contains("Max-Age=0"));
    }

    #[test]
    fn untouched_jar_leaves_request_alone() {
        let jar = CookieJar::from_headers(&headers_with("a=1"));
        let mut req = headers_with("a=1");
        jar.write_request_headers(&mut req);
        assert_eq!(req.get(header::COOKIE).unwrap(), "a=1");
    }
}
