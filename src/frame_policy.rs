//! Decides whether an origin forbids being framed.
//!
//! Two response headers are consulted: a `frame-ancestors` directive inside
//! `Content-Security-Policy`, and `X-Frame-Options`. `SAMEORIGIN` is checked
//! against the proxy's own origin, since the proxied document is what the
//! canvas ends up framing.

use reqwest::header::{HeaderMap, CONTENT_SECURITY_POLICY, X_FRAME_OPTIONS};
use url::{Origin, Url};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramePolicy {
    pub disallowed: bool,
}

impl FramePolicy {
    pub const ALLOWED: FramePolicy = FramePolicy { disallowed: false };

    pub fn evaluate(headers: &HeaderMap, final_url: &Url, proxy_origin: &Origin) -> Self {
        let csp_denies = headers
            .get_all(CONTENT_SECURITY_POLICY)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(csp_denies_all_ancestors);

        let xfo_denies = headers
            .get_all(X_FRAME_OPTIONS)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|value| xfo_denies(value, final_url, proxy_origin));

        Self {
            disallowed: csp_denies || xfo_denies,
        }
    }

    pub fn frame_allowed(&self) -> bool {
        !self.disallowed
    }
}

fn csp_denies_all_ancestors(policy: &str) -> bool {
    policy.split(';').any(|directive| {
        let mut tokens = directive.split_whitespace();
        let Some(name) = tokens.next() else {
            return false;
        };
        if !name.eq_ignore_ascii_case("frame-ancestors") {
            return false;
        }
        let sources: Vec<&str> = tokens.collect();
        matches!(sources.as_slice(), [only] if only.eq_ignore_ascii_case("'none'") || only.eq_ignore_ascii_case("none"))
    })
}

fn xfo_denies(value: &str, final_url: &Url, proxy_origin: &Origin) -> bool {
    let value = value.trim();
    if value.eq_ignore_ascii_case("deny") {
        true
    } else if value.eq_ignore_ascii_case("sameorigin") {
        final_url.origin() != *proxy_origin
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn proxy_origin() -> Origin {
        Url::parse("http://localhost:3000").unwrap().origin()
    }

    fn target() -> Url {
        Url::parse("https://a-trusted-site.test/page").unwrap()
    }

    fn headers(pairs: &[(&reqwest::header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append((*name).clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn no_headers_allows_framing() {
        let policy = FramePolicy::evaluate(&HeaderMap::new(), &target(), &proxy_origin());
        assert!(policy.frame_allowed());
    }

    #[test]
    fn xfo_deny_is_case_insensitive() {
        for value in ["deny", "DENY", " Deny "] {
            let h = headers(&[(&X_FRAME_OPTIONS, value)]);
            assert!(FramePolicy::evaluate(&h, &target(), &proxy_origin()).disallowed, "{value}");
        }
    }

    #[test]
    fn xfo_sameorigin_blocks_foreign_origin() {
        let h = headers(&[(&X_FRAME_OPTIONS, "SAMEORIGIN")]);
        assert!(FramePolicy::evaluate(&h, &target(), &proxy_origin()).disallowed);
    }

    #[test]
    fn xfo_sameorigin_allows_proxy_origin() {
        let h = headers(&[(&X_FRAME_OPTIONS, "sameorigin")]);
        let same = Url::parse("http://localhost:3000/board").unwrap();
        assert!(!FramePolicy::evaluate(&h, &same, &proxy_origin()).disallowed);
    }

    #[test]
    fn xfo_allow_from_is_ignored() {
        let h = headers(&[(&X_FRAME_OPTIONS, "ALLOW-FROM https://x.test")]);
        assert!(!FramePolicy::evaluate(&h, &target(), &proxy_origin()).disallowed);
    }

    #[test]
    fn csp_frame_ancestors_none() {
        for value in [
            "frame-ancestors 'none'",
            "default-src 'self'; Frame-Ancestors 'NONE'",
            "frame-ancestors none;",
        ] {
            let h = headers(&[(&CONTENT_SECURITY_POLICY, value)]);
            assert!(FramePolicy::evaluate(&h, &target(), &proxy_origin()).disallowed, "{value}");
        }
    }

    #[test]
    fn csp_frame_ancestors_with_sources_is_allowed() {
        let h = headers(&[(&CONTENT_SECURITY_POLICY, "frame-ancestors 'self' https://x.test")]);
        assert!(!FramePolicy::evaluate(&h, &target(), &proxy_origin()).disallowed);
    }

    #[test]
    fn any_of_several_csp_headers_can_deny() {
        let h = headers(&[
            (&CONTENT_SECURITY_POLICY, "script-src 'self'"),
            (&CONTENT_SECURITY_POLICY, "frame-ancestors 'none'"),
        ]);
        assert!(FramePolicy::evaluate(&h, &target(), &proxy_origin()).disallowed);
    }
}
