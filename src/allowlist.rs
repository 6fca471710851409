use std::sync::Arc;
use url::Url;

/// Hosts that get script-preserving embeds when nothing is configured.
pub const DEFAULT_EMBED_WHITELIST: &str = "youtube.com,vimeo.com,codepen.io,figma.com";

/// Lowercase, trim and drop one leading `www.`.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    }
}

/// Immutable snapshot of the embed allow-list.
///
/// Built once from configuration and shared by every request handler;
/// clones only bump a reference count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    hosts: Arc<[String]>,
}

impl AllowList {
    /// Parse a comma-separated host list. Order is kept, duplicates and
    /// blank entries are dropped.
    pub fn parse(raw: &str) -> Self {
        let mut hosts: Vec<String> = Vec::new();
        for entry in raw.split(',') {
            let host = normalize_host(entry);
            if host.is_empty() || hosts.contains(&host) {
                continue;
            }
            hosts.push(host);
        }
        Self {
            hosts: hosts.into(),
        }
    }

    pub fn contains_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        !host.is_empty() && self.hosts.iter().any(|h| *h == host)
    }

    pub fn allows_url(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| self.contains_host(host))
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_case_and_www() {
        let list = AllowList::parse("Example.com, WWW.Foo.org");
        assert_eq!(list.hosts(), &["example.com".to_string(), "foo.org".to_string()]);
    }

    #[test]
    fn parse_drops_blanks_and_duplicates() {
        let list = AllowList::parse(" ,a.test,,www.a.test, b.test ,");
        assert_eq!(list.hosts(), &["a.test".to_string(), "b.test".to_string()]);
    }

    #[test]
    fn only_one_www_prefix_is_stripped() {
        assert_eq!(normalize_host("www.www.x.test"), "www.x.test");
    }

    #[test]
    fn lookup_normalizes_the_query() {
        let list = AllowList::parse("youtube.com");
        assert!(list.contains_host("WWW.YouTube.com"));
        assert!(list.contains_host("youtube.com"));
        assert!(!list.contains_host("m.youtube.com"));
        assert!(!list.contains_host(""));
    }

    #[test]
    fn allows_url_uses_the_host() {
        let list = AllowList::parse("codepen.io");
        let url = Url::parse("https://www.codepen.io/pen/abc").unwrap();
        assert!(list.allows_url(&url));
        let other = Url::parse("https://evil.test/?codepen.io").unwrap();
        assert!(!list.allows_url(&other));
    }

    #[test]
    fn default_list_is_not_empty() {
        assert!(!AllowList::parse(DEFAULT_EMBED_WHITELIST).is_empty());
    }
}
