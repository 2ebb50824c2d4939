//! Session id propagation: the session cookie and the `;jsessionid=` path parameter.

use serde::Deserialize;

use crate::http::Headers;

/// How a session id travels between client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    Cookie,
    Url,
}

/// Attributes of the session cookie.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    pub name: String,
    pub domain: Option<String>,
    /// Cookie path; the application's context path (or `/`) when unset.
    pub path: Option<String>,
    pub http_only: bool,
    /// Force `Secure`; otherwise it is set only on TLS connections.
    pub secure: bool,
    pub max_age: Option<i64>,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "JSESSIONID".to_owned(),
            domain: None,
            path: None,
            http_only: true,
            secure: false,
            max_age: None,
        }
    }
}

impl CookieConfig {
    /// Renders a `Set-Cookie` value for `id`.
    ///
    /// # Examples
    ///
    /// ```
    /// use servlette::session::CookieConfig;
    ///
    /// let cookie = CookieConfig::default();
    /// assert_eq!(
    ///     cookie.header_value("ABC", "/shop", false),
    ///     "JSESSIONID=ABC; Path=/shop; HttpOnly"
    /// );
    /// ```
    pub fn header_value(&self, id: &str, context_path: &str, secure_connection: bool) -> String {
        let mut value = format!("{}={}", self.name, id);
        let path = match self.path.as_deref() {
            Some(path) => path,
            None if context_path.is_empty() => "/",
            None => context_path,
        };
        value.push_str("; Path=");
        value.push_str(path);
        if let Some(domain) = &self.domain {
            value.push_str("; Domain=");
            value.push_str(domain);
        }
        if let Some(max_age) = self.max_age {
            value.push_str(&format!("; Max-Age={max_age}"));
        }
        if self.secure || secure_connection {
            value.push_str("; Secure");
        }
        if self.http_only {
            value.push_str("; HttpOnly");
        }
        value
    }
}

/// Finds a cookie by name across every `Cookie` header.
pub fn cookie_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .get_all("cookie")
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().trim_matches('"'))
}

/// Removes matrix parameters (`;name=value`) from every path segment.
///
/// Returns the clean path and the parameters of the last segment, which is
/// where a URL-tracked session id lives.
///
/// # Examples
///
/// ```
/// use servlette::session::tracking::strip_path_parameters;
///
/// let (path, params) = strip_path_parameters("/ctx/snoop/index.html;jsessionid=ABC123");
/// assert_eq!(path, "/ctx/snoop/index.html");
/// assert_eq!(params, vec![("jsessionid".to_owned(), "ABC123".to_owned())]);
/// ```
pub fn strip_path_parameters(path: &str) -> (String, Vec<(String, String)>) {
    if !path.contains(';') {
        return (path.to_owned(), Vec::new());
    }
    let segments: Vec<&str> = path.split('/').collect();
    let last = segments.len() - 1;
    let mut clean = Vec::with_capacity(segments.len());
    let mut params = Vec::new();
    for (i, segment) in segments.iter().enumerate() {
        let mut parts = segment.split(';');
        clean.push(parts.next().unwrap_or_default());
        if i == last {
            params.extend(parts.filter(|p| !p.is_empty()).map(|p| match p.split_once('=') {
                Some((name, value)) => (name.to_owned(), value.to_owned()),
                None => (p.to_owned(), String::new()),
            }));
        }
    }
    (clean.join("/"), params)
}

/// Returns `true` for URLs without a scheme or authority.
pub fn is_relative(url: &str) -> bool {
    if url.starts_with("//") {
        return false;
    }
    match url.find(':') {
        Some(colon) => url[..colon].contains(['/', '?', '#']),
        None => true,
    }
}

/// Inserts `;<param>=<id>` before the query or fragment of `url`.
pub fn encode_url(url: &str, param: &str, id: &str) -> String {
    let split = url.find(['?', '#']).unwrap_or(url.len());
    let (path, rest) = url.split_at(split);
    format!("{path};{param}={id}{rest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_lookup_spans_headers_and_pairs() {
        let mut headers = Headers::new();
        headers.append("Cookie", "theme=dark; JSESSIONID=XYZ789");
        headers.append("cookie", "other=1");
        assert_eq!(cookie_value(&headers, "JSESSIONID"), Some("XYZ789"));
        assert_eq!(cookie_value(&headers, "other"), Some("1"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn matrix_params_are_removed_from_every_segment() {
        let (path, params) = strip_path_parameters("/a;v=1/b;jsessionid=S1;x");
        assert_eq!(path, "/a/b");
        assert_eq!(
            params,
            vec![("jsessionid".to_owned(), "S1".to_owned()), ("x".to_owned(), String::new())]
        );
    }

    #[test]
    fn plain_paths_pass_through() {
        assert_eq!(strip_path_parameters("/a/b"), ("/a/b".to_owned(), Vec::new()));
    }

    #[test]
    fn relative_url_detection() {
        assert!(is_relative("/ctx/page"));
        assert!(is_relative("page?next=http://x"));
        assert!(!is_relative("https://example.com/"));
        assert!(!is_relative("//example.com/x"));
        assert!(!is_relative("mailto:someone@example.com"));
    }

    #[test]
    fn id_goes_before_query_and_fragment() {
        assert_eq!(encode_url("/a?b=1", "jsessionid", "ID"), "/a;jsessionid=ID?b=1");
        assert_eq!(encode_url("/a#top", "jsessionid", "ID"), "/a;jsessionid=ID#top");
        assert_eq!(encode_url("/a", "sid", "ID"), "/a;sid=ID");
    }

    #[test]
    fn cookie_attributes() {
        let cookie = CookieConfig {
            domain: Some("example.com".into()),
            max_age: Some(600),
            http_only: false,
            ..CookieConfig::default()
        };
        assert_eq!(
            cookie.header_value("ID", "", true),
            "JSESSIONID=ID; Path=/; Domain=example.com; Max-Age=600; Secure"
        );
    }
}
