use anyhow::Result;
use axum::http::Uri;
use url::Url;

use super::BackendDirective;

/// Forwards requests to a generic HTTP origin.
///
/// The request path is appended to the backend base path with exactly one
/// slash between them and the backend's own query comes first.
#[derive(Debug, Clone)]
pub struct PassthroughDirector {
    target: Url,
    host: String,
}

impl PassthroughDirector {
    pub fn new(target: Url) -> Self {
        let host = match (target.host_str(), target.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => String::new(),
        };
        Self { target, host }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn direct(&self, uri: &Uri) -> Result<BackendDirective> {
        let path = join_paths(self.target.path(), uri.path());

        let mut url = self.target.clone();
        url.set_path(&path);
        let query = match (self.target.query(), uri.query()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{a}&{b}")),
            (Some(a), _) if !a.is_empty() => Some(a.to_string()),
            (_, Some(b)) if !b.is_empty() => Some(b.to_string()),
            _ => None,
        };
        url.set_query(query.as_deref());
        url.set_fragment(None);

        Ok(BackendDirective {
            key: path.trim_start_matches('/').to_string(),
            url,
            headers: Vec::new(),
            expires_at: None,
        })
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn director(target: &str) -> PassthroughDirector {
        PassthroughDirector::new(Url::parse(target).unwrap())
    }

    #[test]
    fn rewrites_scheme_and_authority() {
        let d = director("https://cache.example.com:8443");
        let directive = d.direct(&Uri::from_static("/cas/abc")).unwrap();
        assert_eq!(directive.url.as_str(), "https://cache.example.com:8443/cas/abc");
        assert_eq!(directive.key, "cas/abc");
        assert!(directive.expires_at.is_none());
        assert_eq!(d.host(), "cache.example.com:8443");
    }

    #[test]
    fn joins_base_path_with_single_slash() {
        let d = director("http://origin/base/");
        let directive = d.direct(&Uri::from_static("/ac/1")).unwrap();
        assert_eq!(directive.url.as_str(), "http://origin/base/ac/1");

        let d = director("http://origin/base");
        let directive = d.direct(&Uri::from_static("/ac/1")).unwrap();
        assert_eq!(directive.url.as_str(), "http://origin/base/ac/1");
    }

    #[test]
    fn merges_query_strings() {
        let d = director("http://origin/?token=t");
        let directive = d.direct(&Uri::from_static("/x?a=1")).unwrap();
        assert_eq!(directive.url.query(), Some("token=t&a=1"));

        let d = director("http://origin/");
        let directive = d.direct(&Uri::from_static("/x?a=1")).unwrap();
        assert_eq!(directive.url.query(), Some("a=1"));

        let directive = d.direct(&Uri::from_static("/x")).unwrap();
        assert_eq!(directive.url.query(), None);
    }
}
