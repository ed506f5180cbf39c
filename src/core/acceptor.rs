use std::{cmp::Reverse, sync::Arc};

/// A host/path pair a deployed API accepts requests on.
#[derive(Debug)]
pub struct HttpAcceptor<T> {
    host: Option<String>,
    path: String,
    declaration: usize,
    target: Arc<T>,
}

impl<T> Clone for HttpAcceptor<T> {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            path: self.path.clone(),
            declaration: self.declaration,
            target: self.target.clone(),
        }
    }
}

impl<T> HttpAcceptor<T> {
    pub fn new(host: Option<&str>, path: &str, target: Arc<T>) -> Self {
        let mut path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        if !path.ends_with('/') {
            path.push('/');
        }
        Self {
            host: host
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_ascii_lowercase),
            path,
            declaration: 0,
            target,
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Path with a trailing `/`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path without the trailing `/`, `/` for the root
    pub fn context_path(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        if trimmed.is_empty() { "/" } else { trimmed }
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    fn host_matches(&self, host: Option<&str>) -> bool {
        let Some(expected) = &self.host else {
            return true;
        };
        let Some(host) = host else {
            return false;
        };
        match expected.strip_prefix('*') {
            Some(suffix) => {
                host.len() > suffix.len()
                    && host
                        .to_ascii_lowercase()
                        .ends_with(suffix)
            }
            None => expected.eq_ignore_ascii_case(host),
        }
    }

    /// Host match, then the request path with a trailing `/` starting with the acceptor path.
    pub fn accepts(&self, host: Option<&str>, path: &str) -> bool {
        if !self.host_matches(host) {
            return false;
        }
        if path.ends_with('/') {
            path.starts_with(&self.path)
        } else {
            format!("{path}/").starts_with(&self.path)
        }
    }

    /// Exact hosts, then wildcard hosts by decreasing suffix length, then host-less
    /// acceptors; longer paths first within a class, declaration order last.
    fn rank(&self) -> (u8, Reverse<usize>, Reverse<usize>, usize) {
        let (class, host_len) = match &self.host {
            Some(host) if host.starts_with("*.") => (1, host.len()),
            Some(host) => (0, host.len()),
            None => (2, 0),
        };
        (class, Reverse(host_len), Reverse(self.path.len()), self.declaration)
    }
}

/// Immutable, ordered set of acceptors; replaced as a whole on every deployment event.
#[derive(Debug)]
pub struct AcceptorTable<T> {
    acceptors: Vec<HttpAcceptor<T>>,
}

impl<T> Default for AcceptorTable<T> {
    fn default() -> Self {
        Self {
            acceptors: Vec::new(),
        }
    }
}

impl<T> AcceptorTable<T> {
    pub fn new(acceptors: impl IntoIterator<Item = HttpAcceptor<T>>) -> Self {
        let mut acceptors: Vec<HttpAcceptor<T>> = acceptors
            .into_iter()
            .enumerate()
            .map(|(declaration, mut acceptor)| {
                acceptor.declaration = declaration;
                acceptor
            })
            .collect();
        acceptors.sort_by_key(HttpAcceptor::rank);
        Self { acceptors }
    }

    pub fn resolve(&self, host: Option<&str>, path: &str) -> Option<&HttpAcceptor<T>> {
        self.acceptors.iter().find(|acceptor| acceptor.accepts(host, path))
    }

    pub fn acceptors(&self) -> &[HttpAcceptor<T>] {
        &self.acceptors
    }

    pub fn len(&self) -> usize {
        self.acceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acceptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acceptor(host: Option<&str>, path: &str) -> HttpAcceptor<String> {
        HttpAcceptor::new(host, path, Arc::new(format!("{}{}", host.unwrap_or(""), path)))
    }

    fn resolve<'a>(table: &'a AcceptorTable<String>, host: Option<&str>, path: &str) -> Option<&'a str> {
        table.resolve(host, path).map(|a| a.target().as_str())
    }

    #[test]
    fn test_path_matching_on_segment_boundary() {
        let a = acceptor(None, "/orders");
        assert!(a.accepts(None, "/orders"));
        assert!(a.accepts(None, "/orders/"));
        assert!(a.accepts(None, "/orders/42"));
        assert!(!a.accepts(None, "/ordersx"));
        assert_eq!(a.context_path(), "/orders");
        assert_eq!(acceptor(None, "/").context_path(), "/");
    }

    #[test]
    fn test_longer_paths_first() {
        let table = AcceptorTable::new([acceptor(None, "/"), acceptor(None, "/api"), acceptor(None, "/api/v2")]);
        assert_eq!(resolve(&table, None, "/api/v2/x"), Some("/api/v2"));
        assert_eq!(resolve(&table, None, "/api/v1"), Some("/api"));
        assert_eq!(resolve(&table, None, "/other"), Some("/"));
    }

    #[test]
    fn test_host_classes() {
        let table = AcceptorTable::new([
            acceptor(None, "/"),
            acceptor(Some("*.acme.com"), "/"),
            acceptor(Some("*.eu.acme.com"), "/"),
            acceptor(Some("api.eu.acme.com"), "/"),
        ]);
        assert_eq!(resolve(&table, Some("api.eu.acme.com"), "/x"), Some("api.eu.acme.com/"));
        assert_eq!(resolve(&table, Some("web.eu.acme.com"), "/x"), Some("*.eu.acme.com/"));
        assert_eq!(resolve(&table, Some("www.acme.com"), "/x"), Some("*.acme.com/"));
        assert_eq!(resolve(&table, Some("acme.com"), "/x"), Some("/"));
        assert_eq!(resolve(&table, None, "/x"), Some("/"));
    }

    #[test]
    fn test_host_acceptor_wins_over_longer_hostless_path() {
        let table = AcceptorTable::new([acceptor(None, "/orders/v1"), acceptor(Some("API.acme.com"), "/orders")]);
        assert_eq!(resolve(&table, Some("api.acme.com"), "/orders/v1"), Some("API.acme.com/orders"));
        assert_eq!(resolve(&table, Some("other.com"), "/orders/v1"), Some("/orders/v1"));
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let first = HttpAcceptor::new(None, "/same", Arc::new("first".to_string()));
        let second = HttpAcceptor::new(None, "/same/", Arc::new("second".to_string()));
        let table = AcceptorTable::new([first, second]);
        assert_eq!(resolve(&table, None, "/same"), Some("first"));
        assert!(resolve(&AcceptorTable::default(), None, "/").is_none());
    }
}
