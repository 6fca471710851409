use encoding_rs::{Encoding, UTF_8};
use futures::StreamExt;
use regex::bytes::Regex;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
pub const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
pub const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Redirect limit for the full page fetch.
pub const PAGE_MAX_REDIRECTS: usize = 10;
/// Redirect limit for the lightweight info lookup.
pub const INFO_MAX_REDIRECTS: usize = 5;

const SNIPPET_CHARS: usize = 500;
/// Most bytes read from an error response to build its preview.
const SNIPPET_BYTES: usize = SNIPPET_CHARS * 4;
/// How far into a document a `<meta charset>` is looked for.
const META_PRESCAN_BYTES: usize = 1024;
const META_CHARSET: &str = r#"(?i-u)<meta[^>]+charset\s*=\s*["']?\s*([a-z0-9_:.\-]+)"#;

#[derive(Debug)]
pub struct FetchResult {
    pub final_url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream {url} answered {status}")]
    Status {
        url: Url,
        status: StatusCode,
        headers: HeaderMap,
        snippet: String,
    },

    #[error("upstream {url} timed out")]
    Timeout { url: Url },

    #[error("request to {url} failed: {source}")]
    Request {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("upstream {url} body exceeds {limit} bytes")]
    BodyTooLarge { url: Url, limit: usize },
}

impl FetchError {
    fn from_reqwest(url: &Url, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            FetchError::Timeout { url: url.clone() }
        } else {
            FetchError::Request {
                url: url.clone(),
                source,
            }
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Dump everything useful for diagnosing bot-protection blocks.
    pub fn log_diagnostics(&self) {
        match self {
            FetchError::Status {
                url,
                status,
                headers,
                snippet,
            } => {
                warn!(%url, %status, "upstream rejected the request");
                for (name, value) in headers {
                    warn!(%url, "  {}: {:?}", name, value);
                }
                warn!(%url, "body preview: {}", snippet);
            }
            other => warn!("{}", other),
        }
    }
}

/// Build an outbound client following at most `max_redirects` redirects.
pub fn build_client(
    max_redirects: usize,
    timeout: Duration,
    connect_timeout: Duration,
) -> reqwest::Result<Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(max_redirects))
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .build()
}

/// Referer sent upstream: the target's own origin, as if the user navigated
/// from the site's front page.
fn referer_for(url: &Url) -> String {
    format!("{}/", url.origin().ascii_serialization())
}

async fn send_browser_like(client: &Client, url: &Url) -> Result<Response, FetchError> {
    client
        .get(url.clone())
        .header(header::USER_AGENT, USER_AGENT)
        .header(header::ACCEPT, ACCEPT_HTML)
        .header(header::ACCEPT_LANGUAGE, ACCEPT_LANGUAGE)
        .header(header::REFERER, referer_for(url))
        .header("Sec-Fetch-Dest", "document")
        .header("Sec-Fetch-Mode", "navigate")
        .header("Sec-Fetch-Site", "none")
        .header("Sec-Fetch-User", "?1")
        .header(header::UPGRADE_INSECURE_REQUESTS, "1")
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(url, e))
}

fn content_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|part| {
        let (name, value) = part.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let label = value.trim().trim_matches('"').trim_matches('\'');
        (!label.is_empty()).then_some(label)
    })
}

fn meta_charset(body: &[u8]) -> Option<&'static Encoding> {
    let prefix = &body[..body.len().min(META_PRESCAN_BYTES)];
    let pattern = Regex::new(META_CHARSET).ok()?;
    let label = pattern.captures(prefix)?.get(1)?;
    Encoding::for_label(label.as_bytes())
}

/// Decode a document using the `Content-Type` charset, then a
/// `<meta charset>` near the top, then UTF-8. A byte-order mark wins over all
/// of them.
pub fn decode_body(body: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(charset_param)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .or_else(|| meta_charset(body))
        .unwrap_or(UTF_8);
    let (text, used, had_errors) = encoding.decode(body);
    if had_errors {
        debug!(encoding = used.name(), "document contained malformed sequences");
    }
    text.into_owned()
}

/// Read at most `limit` bytes of the body and drop the rest unread.
async fn read_prefix(response: Response, limit: usize) -> Vec<u8> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while body.len() < limit {
        match stream.next().await {
            Some(Ok(chunk)) => body.extend_from_slice(&chunk),
            _ => break,
        }
    }
    body.truncate(limit);
    body
}

/// Turn 4xx/5xx into [`FetchError::Status`], keeping headers and a short
/// body preview for the logs.
async fn reject_client_and_server_errors(response: Response) -> Result<Response, FetchError> {
    let status = response.status();
    if !status.is_client_error() && !status.is_server_error() {
        return Ok(response);
    }
    let url = response.url().clone();
    let headers = response.headers().clone();
    let content_type = content_type(&response);
    let preview = read_prefix(response, SNIPPET_BYTES).await;
    Err(FetchError::Status {
        url,
        status,
        headers,
        snippet: decode_body(&preview, content_type.as_deref())
            .chars()
            .take(SNIPPET_CHARS)
            .collect(),
    })
}

async fn read_capped(response: Response, limit: usize) -> Result<String, FetchError> {
    let url = response.url().clone();
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(FetchError::BodyTooLarge { url, limit });
    }

    let content_type = content_type(&response);
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::from_reqwest(&url, e))?;
        if body.len() + chunk.len() > limit {
            return Err(FetchError::BodyTooLarge { url, limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(decode_body(&body, content_type.as_deref()))
}

/// GET `url` the way a browser would and return the document text.
pub async fn fetch_page(
    client: &Client,
    url: &Url,
    max_body_bytes: usize,
) -> Result<FetchResult, FetchError> {
    debug!(%url, "fetching page");
    let response = send_browser_like(client, url).await?;
    let response = reject_client_and_server_errors(response).await?;

    let final_url = response.url().clone();
    let status = response.status();
    let headers = response.headers().clone();
    let body = read_capped(response, max_body_bytes).await?;

    debug!(%final_url, %status, bytes = body.len(), "page fetched");
    Ok(FetchResult {
        final_url,
        status,
        headers,
        body,
    })
}

/// Follow redirects for `url` without reading the body. Returns the final URL
/// and the headers of the last response.
pub async fn resolve_final(client: &Client, url: &Url) -> Result<(Url, HeaderMap), FetchError> {
    let response = send_browser_like(client, url).await?;
    let response = reject_client_and_server_errors(response).await?;
    Ok((response.url().clone(), response.headers().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referer_is_the_target_origin() {
        let url = Url::parse("https://news.test:8443/a/b?c=d").unwrap();
        assert_eq!(referer_for(&url), "https://news.test:8443/");
    }

    #[test]
    fn status_error_exposes_the_code() {
        let err = FetchError::Status {
            url: Url::parse("https://x.test/").unwrap(),
            status: StatusCode::FORBIDDEN,
            headers: HeaderMap::new(),
            snippet: String::new(),
        };
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
        assert_eq!(err.to_string(), "upstream https://x.test/ answered 403 Forbidden");
    }

    #[test]
    fn latin1_is_decoded_from_the_header_charset() {
        let text = decode_body(b"<p>caf\xE9</p>", Some("text/html; charset=ISO-8859-1"));
        assert_eq!(text, "<p>caf\u{e9}</p>");
    }

    #[test]
    fn meta_charset_is_used_without_a_header_charset() {
        let doc = b"<html><head><meta charset=\"windows-1252\"></head><p>\x93hi\x94</p>";
        let text = decode_body(doc, Some("text/html"));
        assert!(text.contains("\u{201c}hi\u{201d}"), "{text}");

        let doc = b"<meta http-equiv=\"Content-Type\" content=\"text/html; charset=iso-8859-1\"><p>\xE9</p>";
        assert!(decode_body(doc, None).contains('\u{e9}'));
    }

    #[test]
    fn header_charset_wins_over_meta() {
        let doc = "<meta charset=\"iso-8859-1\"><p>caf\u{e9}</p>";
        let text = decode_body(doc.as_bytes(), Some("text/html; charset=\"utf-8\""));
        assert_eq!(text, doc);
    }

    #[test]
    fn unknown_labels_fall_back_to_utf8() {
        let text = decode_body("\u{e9}".as_bytes(), Some("text/html; charset=klingon"));
        assert_eq!(text, "\u{e9}");
        assert_eq!(decode_body(b"caf\xE9", None), "caf\u{fffd}");
    }

    #[tokio::test]
    async fn error_preview_stops_reading_an_endless_body() {
        let endless = futures::stream::repeat_with(|| Ok::<_, std::io::Error>(vec![b'x'; 1024]));
        let response = Response::from(
            axum::http::Response::builder()
                .status(403)
                .body(reqwest::Body::wrap_stream(endless))
                .unwrap(),
        );
        assert_eq!(read_prefix(response, 4096).await.len(), 4096);
    }

    #[tokio::test]
    async fn error_snippet_is_bounded() {
        let response = Response::from(
            axum::http::Response::builder()
                .status(403)
                .header("content-type", "text/html")
                .body(vec![b'y'; 64 * 1024])
                .unwrap(),
        );
        match reject_client_and_server_errors(response).await {
            Err(FetchError::Status { snippet, status, .. }) => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(snippet.len(), SNIPPET_CHARS);
            }
            other => panic!("expected a status error, got {other:?}"),
        }
    }

    #[test]
    fn clients_build_with_both_redirect_limits() {
        let timeout = Duration::from_secs(5);
        assert!(build_client(PAGE_MAX_REDIRECTS, timeout, timeout).is_ok());
        assert!(build_client(INFO_MAX_REDIRECTS, timeout, timeout).is_ok());
    }
}
