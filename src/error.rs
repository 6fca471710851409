//! Endpoint-level errors and how they are shown to the browser.
//!
//! Clients only ever see a status code, a short message and the target URL.
//! Upstream headers, bodies and error chains stay in the server log.

use crate::fetch::FetchError;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing `url` query parameter")]
    MissingTarget,

    #[error("invalid target URL {input:?}: {reason}")]
    InvalidTarget { input: String, reason: String },

    #[error("could not load {target}: {source}")]
    Unreachable {
        target: Url,
        #[source]
        source: FetchError,
    },
}

impl ProxyError {
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::MissingTarget | Self::InvalidTarget { .. })
    }

    /// Message safe to show to the user.
    pub fn public_message(&self) -> String {
        match self {
            Self::MissingTarget => "A target URL is required in the `url` parameter.".to_string(),
            Self::InvalidTarget { input, .. } => {
                format!("\"{}\" is not a valid absolute http(s) URL.", input)
            }
            Self::Unreachable { target, .. } => format!(
                "The page at {} could not be loaded. The site may be blocking automated access.",
                target
            ),
        }
    }
}

/// Parse the `url` query value into an absolute http(s) URL.
pub fn parse_target(raw: Option<&str>) -> Result<Url, ProxyError> {
    let input = raw.map(str::trim).unwrap_or_default();
    if input.is_empty() {
        return Err(ProxyError::MissingTarget);
    }
    let invalid = |reason: String| ProxyError::InvalidTarget {
        input: input.to_string(),
        reason,
    };
    let url = Url::parse(input).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

/// Error rendered as an HTML fragment, for responses that end up in a frame.
#[derive(Debug)]
pub struct HtmlError(pub ProxyError);

impl From<ProxyError> for HtmlError {
    fn from(err: ProxyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HtmlError {
    fn into_response(self) -> Response {
        let status = if self.0.is_input_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::BAD_GATEWAY
        };
        let link = match &self.0 {
            ProxyError::Unreachable { target, .. } => {
                let href = html_escape::encode_double_quoted_attribute(target.as_str());
                format!(
                    r#"<p><a href="{}" target="_blank" rel="noopener noreferrer">Open the page in a new tab</a></p>"#,
                    href
                )
            }
            _ => String::new(),
        };
        let body = format!(
            r#"<div style="font:14px/1.5 system-ui,sans-serif;padding:16px;color:#444"><h3>Unable to display this page</h3><p>{}</p>{}</div>"#,
            html_escape::encode_text(&self.0.public_message()),
            link
        );
        (
            status,
            [
                (header::CONTENT_TYPE, "text/html; charset=utf-8"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            body,
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    ok: bool,
    message: String,
}

/// Error rendered as `{ ok: false, message }`.
#[derive(Debug)]
pub struct JsonError(pub ProxyError);

impl From<ProxyError> for JsonError {
    fn from(err: ProxyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for JsonError {
    fn into_response(self) -> Response {
        let status = if self.0.is_input_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let envelope = ErrorEnvelope {
            ok: false,
            message: self.0.public_message(),
        };
        (status, Json(envelope)).into_response()
    }
}
