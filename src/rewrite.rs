//! HTML rewriting for proxied documents.
//!
//! The rewrite is an ordered list of steps, each a pure `(html, context) -> html`
//! function. A step that fails is logged and skipped; the document produced by
//! the previous step carries on through the rest of the pipeline, so a broken
//! page still comes back as a best-effort rewrite instead of an error.

use crate::allowlist::AllowList;
use crate::frame_policy::FramePolicy;
use lol_html::html_content::ContentType;
use lol_html::{element, HtmlRewriter, Settings};
use regex::Regex;
use std::cell::Cell;
use thiserror::Error;
use tracing::warn;
use url::Url;

/// `http-equiv` values that would block framing or navigate the frame away.
const BLOCKING_META: &[&str] = &[
    "content-security-policy",
    "content-security-policy-report-only",
    "x-frame-options",
    "refresh",
];

/// Substrings that identify a dev-server client bundled into the page.
const DEV_MARKERS: &[&str] = &["@vite", "@react-refresh", "webpack-dev-server", "__webpack_hmr"];

const LOCALHOST_HOST: &str = r"(?i)localhost:\d+";
const LOCALHOST_ORIGIN: &str = r"(?i)https?://localhost:\d+";
const DEV_CLIENT_PATH: &str = r"/@vite/client|/@react-refresh";

/// Link prefixes that are never routed through the proxy.
const PASSTHROUGH_SCHEMES: &[&str] = &["javascript:", "mailto:", "tel:", "data:", "blob:"];

const BANNER_HTML: &str = concat!(
    r#"<div data-proxy-banner="frame-policy" style="position:sticky;top:0;z-index:2147483647;"#,
    r#"padding:8px 12px;background:#fef3c7;color:#78350f;border-bottom:1px solid #f59e0b;"#,
    r#"font:13px/1.4 system-ui,sans-serif;">"#,
    "This site&#39;s security policy does not allow it to be displayed inside a frame. ",
    "Showing a script-free version.",
    "</div>"
);

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("html rewriter: {0}")]
    Html(#[from] lol_html::errors::RewritingError),

    #[error("pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("base href {0:?} is not an absolute URL")]
    BaseHref(String),
}

/// Whether the proxied document may keep its scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewritePolicy {
    pub keep_scripts: bool,
}

impl RewritePolicy {
    pub fn derive(embed_requested: bool, host_allowed: bool, frame: FramePolicy) -> Self {
        Self {
            keep_scripts: embed_requested && host_allowed && !frame.disallowed,
        }
    }
}

/// Everything a rewrite step needs to know about the request.
#[derive(Debug, Clone)]
pub struct RewriteContext<'a> {
    /// `scheme://host[:port]` of the resolved target.
    pub base_href: String,
    pub keep_scripts: bool,
    pub frame_disallowed: bool,
    pub allow_list: &'a AllowList,
    /// Absolute URL of the proxy endpoint, e.g. `http://localhost:3000/api/proxy`.
    pub proxy_endpoint: &'a str,
}

impl<'a> RewriteContext<'a> {
    pub fn new(
        target: &Url,
        policy: RewritePolicy,
        frame: FramePolicy,
        allow_list: &'a AllowList,
        proxy_endpoint: &'a str,
    ) -> Self {
        Self {
            base_href: base_href_for(target),
            keep_scripts: policy.keep_scripts,
            frame_disallowed: frame.disallowed,
            allow_list,
            proxy_endpoint,
        }
    }

    /// Links this rewriter already produced: the absolute endpoint, bare
    /// (GET forms) or with a query.
    fn is_proxy_link(&self, raw: &str) -> bool {
        raw.strip_prefix(self.proxy_endpoint)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('?'))
    }

    /// Absolute http(s) target of a link found in the document, or `None`
    /// when the link should stay untouched.
    fn link_target(&self, base: &Url, raw: &str) -> Option<Url> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') || self.is_proxy_link(raw) {
            return None;
        }
        let lower = raw.to_ascii_lowercase();
        if PASSTHROUGH_SCHEMES.iter().any(|s| lower.starts_with(s)) {
            return None;
        }
        let resolved = base.join(raw).ok()?;
        matches!(resolved.scheme(), "http" | "https").then_some(resolved)
    }

    fn proxied_link(&self, base: &Url, raw: &str) -> Option<String> {
        let target = self.link_target(base, raw)?;
        let embed = self.allow_list.allows_url(&target);
        Some(proxy_href(self.proxy_endpoint, &target, embed))
    }
}

pub fn base_href_for(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Hidden fields carrying the target through a GET form, whose submission
/// replaces the action's query string with the form fields.
fn proxy_form_fields(target: &Url, embed: bool) -> String {
    let mut fields = format!(
        r#"<input type="hidden" name="url" value="{}">"#,
        html_escape::encode_double_quoted_attribute(target.as_str())
    );
    if embed {
        fields.push_str(r#"<input type="hidden" name="embed" value="1">"#);
    }
    fields
}

fn is_get_form(method: Option<String>) -> bool {
    method.map_or(true, |m| m.trim().is_empty() || m.trim().eq_ignore_ascii_case("get"))
}

/// Link back into the proxy endpoint for `target`.
pub fn proxy_href(proxy_endpoint: &str, target: &Url, embed: bool) -> String {
    let mut href = format!("{}?url={}", proxy_endpoint, urlencoding::encode(target.as_str()));
    if embed {
        href.push_str("&embed=1");
    }
    href
}

type Step = fn(&str, &RewriteContext<'_>) -> Result<String, RewriteError>;

const PIPELINE: &[(&str, Step)] = &[
    ("strip_blocking_meta", strip_blocking_meta),
    ("strip_scripts", strip_scripts),
    ("inject_base", inject_base),
    ("patch_dev_urls", patch_dev_urls),
    ("route_links_through_proxy", route_links_through_proxy),
    ("frame_policy_banner", frame_policy_banner),
];

/// Run the full pipeline. Never fails; see the module docs.
pub fn rewrite_document(html: &str, ctx: &RewriteContext<'_>) -> String {
    PIPELINE
        .iter()
        .fold(html.to_string(), |doc, (name, step)| match step(&doc, ctx) {
            Ok(next) => next,
            Err(e) => {
                warn!(step = *name, base = %ctx.base_href, "rewrite step skipped: {}", e);
                doc
            }
        })
}

fn run(html: &str, mut settings: Settings<'_, '_>) -> Result<String, RewriteError> {
    // Ambiguous markup is passed through rather than aborting the step.
    settings.strict = false;
    let mut output = Vec::with_capacity(html.len());
    let mut rewriter = HtmlRewriter::new(settings, |c: &[u8]| output.extend_from_slice(c));
    rewriter.write(html.as_bytes())?;
    rewriter.end()?;
    Ok(String::from_utf8_lossy(&output).into_owned())
}

fn is_dev_artifact(reference: &str, localhost: &Regex) -> bool {
    DEV_MARKERS.iter().any(|m| reference.contains(m)) || localhost.is_match(reference)
}

/// Insert `tag` right after a leading doctype, or at the very start.
fn insert_at_document_start(doc: &str, tag: &str) -> String {
    let trimmed = doc.trim_start();
    let offset = doc.len() - trimmed.len();
    let has_doctype = trimmed
        .get(..9)
        .is_some_and(|p| p.eq_ignore_ascii_case("<!doctype"));
    match trimmed.find('>') {
        Some(end) if has_doctype => {
            let split = offset + end + 1;
            format!("{}{}{}", &doc[..split], tag, &doc[split..])
        }
        _ => format!("{tag}{doc}"),
    }
}

pub fn strip_blocking_meta(html: &str, _ctx: &RewriteContext<'_>) -> Result<String, RewriteError> {
    run(
        html,
        Settings {
            element_content_handlers: vec![element!("meta[http-equiv]", |el| {
                let blocking = el.get_attribute("http-equiv").is_some_and(|v| {
                    let v = v.trim();
                    BLOCKING_META.iter().any(|b| v.eq_ignore_ascii_case(b))
                });
                if blocking {
                    el.remove();
                }
                Ok(())
            })],
            ..Settings::default()
        },
    )
}

/// Drop every script unless the policy keeps them. Dev-server scripts and
/// stylesheets go regardless.
pub fn strip_scripts(html: &str, ctx: &RewriteContext<'_>) -> Result<String, RewriteError> {
    let localhost = Regex::new(LOCALHOST_HOST)?;
    let keep = ctx.keep_scripts;
    run(
        html,
        Settings {
            element_content_handlers: vec![
                element!("script", |el| {
                    let dev = el
                        .get_attribute("src")
                        .is_some_and(|src| is_dev_artifact(&src, &localhost));
                    if !keep || dev {
                        el.remove();
                    }
                    Ok(())
                }),
                element!("link[href]", |el| {
                    if el
                        .get_attribute("href")
                        .is_some_and(|href| is_dev_artifact(&href, &localhost))
                    {
                        el.remove();
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
    )
}

/// Replace any `<base>` with one pointing at the target origin.
pub fn inject_base(html: &str, ctx: &RewriteContext<'_>) -> Result<String, RewriteError> {
    let tag = format!(
        r#"<base href="{}">"#,
        html_escape::encode_double_quoted_attribute(&ctx.base_href)
    );
    let injected = Cell::new(false);
    let output = run(
        html,
        Settings {
            element_content_handlers: vec![
                element!("base", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("head", |el| {
                    if !injected.get() {
                        el.prepend(&tag, ContentType::Html);
                        injected.set(true);
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
    )?;

    if injected.get() {
        Ok(output)
    } else {
        Ok(insert_at_document_start(&output, &tag))
    }
}

/// Point leftover `localhost:<port>` URLs at the target and drop dev-client
/// paths. The proxy's own origin is left alone so already-proxied links keep
/// working when the proxy itself runs on localhost.
pub fn patch_dev_urls(html: &str, ctx: &RewriteContext<'_>) -> Result<String, RewriteError> {
    let localhost = Regex::new(LOCALHOST_ORIGIN)?;
    let dev_paths = Regex::new(DEV_CLIENT_PATH)?;
    let proxy_origin = Url::parse(ctx.proxy_endpoint)
        .map(|u| u.origin().ascii_serialization())
        .unwrap_or_default();
    let patched = localhost.replace_all(html, |caps: &regex::Captures| {
        let found = &caps[0];
        if found.eq_ignore_ascii_case(&proxy_origin) {
            found.to_string()
        } else {
            ctx.base_href.clone()
        }
    });
    Ok(dev_paths.replace_all(&patched, "").into_owned())
}

/// Send anchors and form submissions back through the proxy endpoint.
pub fn route_links_through_proxy(
    html: &str,
    ctx: &RewriteContext<'_>,
) -> Result<String, RewriteError> {
    let base = Url::parse(&ctx.base_href).map_err(|_| RewriteError::BaseHref(ctx.base_href.clone()))?;
    run(
        html,
        Settings {
            element_content_handlers: vec![
                element!("a[href]", |el| {
                    let proxied = el
                        .get_attribute("href")
                        .and_then(|href| ctx.proxied_link(&base, &href));
                    if let Some(proxied) = proxied {
                        el.set_attribute("href", &proxied)?;
                        el.set_attribute("target", "_self")?;
                    }
                    Ok(())
                }),
                element!("form[action]", |el| {
                    let Some(target) = el
                        .get_attribute("action")
                        .and_then(|action| ctx.link_target(&base, &action))
                    else {
                        return Ok(());
                    };
                    let embed = ctx.allow_list.allows_url(&target);
                    if is_get_form(el.get_attribute("method")) {
                        el.set_attribute("action", ctx.proxy_endpoint)?;
                        el.prepend(&proxy_form_fields(&target, embed), ContentType::Html);
                    } else {
                        el.set_attribute("action", &proxy_href(ctx.proxy_endpoint, &target, embed))?;
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
    )
}

/// Warn the viewer when the origin forbids framing. Earlier banners are
/// removed first so a document can be rewritten more than once.
pub fn frame_policy_banner(html: &str, ctx: &RewriteContext<'_>) -> Result<String, RewriteError> {
    let wanted = ctx.frame_disallowed;
    let injected = Cell::new(false);
    let output = run(
        html,
        Settings {
            element_content_handlers: vec![
                element!("[data-proxy-banner]", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("body", |el| {
                    if wanted && !injected.get() {
                        el.prepend(BANNER_HTML, ContentType::Html);
                        injected.set(true);
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
    )?;

    if wanted && !injected.get() {
        Ok(format!("{output}{BANNER_HTML}"))
    } else {
        Ok(output)
    }
}
