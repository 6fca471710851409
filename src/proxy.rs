use crate::allowlist::AllowList;
use crate::config::ProxyConfig;
use crate::error::{parse_target, HtmlError, JsonError, ProxyError};
use crate::fetch::{self, INFO_MAX_REDIRECTS, PAGE_MAX_REDIRECTS};
use crate::frame_policy::FramePolicy;
use crate::headless::PageRenderer;
use crate::rewrite::{rewrite_document, RewriteContext, RewritePolicy};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, Method, Request, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

pub const PROXY_PATH: &str = "/api/proxy";
pub const PROXY_INFO_PATH: &str = "/api/proxy/info";
pub const WHITELIST_PATH: &str = "/api/embed/whitelist";
pub const HEALTH_PATH: &str = "/api/health";

/// Shared, read-only state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<ProxyConfig>,
    proxy_endpoint: Arc<str>,
    page_client: reqwest::Client,
    info_client: reqwest::Client,
    renderer: Arc<dyn PageRenderer>,
}

impl AppState {
    /// State with the renderer matching the build: Chromium when the
    /// `headless` feature is on, otherwise one that always declines.
    pub fn new(config: ProxyConfig) -> reqwest::Result<Self> {
        #[cfg(feature = "headless")]
        let renderer: Arc<dyn PageRenderer> =
            Arc::new(crate::headless::ChromiumRenderer::new(config.headless.clone()));
        #[cfg(not(feature = "headless"))]
        let renderer: Arc<dyn PageRenderer> = Arc::new(crate::headless::DisabledRenderer);

        Self::with_renderer(config, renderer)
    }

    pub fn with_renderer(
        config: ProxyConfig,
        renderer: Arc<dyn PageRenderer>,
    ) -> reqwest::Result<Self> {
        let page_client =
            fetch::build_client(PAGE_MAX_REDIRECTS, config.fetch_timeout, config.connect_timeout)?;
        let info_client =
            fetch::build_client(INFO_MAX_REDIRECTS, config.fetch_timeout, config.connect_timeout)?;
        Ok(Self {
            proxy_endpoint: config.proxy_endpoint().into(),
            config: Arc::new(config),
            page_client,
            info_client,
            renderer,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn allow_list(&self) -> &AllowList {
        &self.config.allow_list
    }
}

// Middleware to log all incoming requests
async fn log_requests(uri: Uri, req: Request<Body>, next: Next) -> Response {
    info!("🌐 {} {}", req.method(), uri);
    next.run(req).await
}

fn cors_layer(origins: &[axum::http::HeaderValue]) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins.iter().cloned()))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600))
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    Router::new()
        .route(PROXY_PATH, get(proxy_handler))
        .route(PROXY_INFO_PATH, get(info_handler))
        .route(WHITELIST_PATH, get(whitelist_handler))
        .route(HEALTH_PATH, get(health_handler))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve the router on `listener` until Ctrl-C.
pub async fn start_proxy_server(state: AppState, listener: TcpListener) -> std::io::Result<()> {
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        })
        .await
}

/// Query of the proxy and info endpoints. Parameters other than the first
/// `url` and `embed` are fields of a GET form routed through the proxy.
#[derive(Debug, Default)]
pub struct ProxyQuery {
    url: Option<String>,
    embed: Option<String>,
    fields: Vec<(String, String)>,
}

impl From<Vec<(String, String)>> for ProxyQuery {
    fn from(pairs: Vec<(String, String)>) -> Self {
        let mut query = Self::default();
        for (name, value) in pairs {
            match name.as_str() {
                "url" if query.url.is_none() => query.url = Some(value),
                "embed" if query.embed.is_none() => query.embed = Some(value),
                _ => query.fields.push((name, value)),
            }
        }
        query
    }
}

impl ProxyQuery {
    fn embed_requested(&self) -> bool {
        self.embed.as_deref().map(str::trim) == Some("1")
    }

    /// The requested URL, with form fields replacing its query the way a
    /// browser submits a GET form.
    fn target(&self) -> Result<Url, ProxyError> {
        let mut target = parse_target(self.url.as_deref())?;
        if !self.fields.is_empty() {
            target.query_pairs_mut().clear().extend_pairs(&self.fields);
        }
        Ok(target)
    }
}

fn html_response(body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response()
}

// GET /api/proxy?url=...&embed=1
async fn proxy_handler(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response, HtmlError> {
    let params = ProxyQuery::from(pairs);
    let target = params.target()?;
    let embed_requested = params.embed_requested();
    let config = state.config();

    match fetch::fetch_page(&state.page_client, &target, config.max_body_bytes).await {
        Ok(page) => {
            let frame = FramePolicy::evaluate(&page.headers, &page.final_url, &config.proxy_origin());
            let host_allowed = state.allow_list().allows_url(&page.final_url);
            let policy = RewritePolicy::derive(embed_requested, host_allowed, frame);
            info!(
                target = %target,
                final_url = %page.final_url,
                status = %page.status,
                frame_disallowed = frame.disallowed,
                keep_scripts = policy.keep_scripts,
                "proxying page"
            );

            let ctx = RewriteContext::new(
                &page.final_url,
                policy,
                frame,
                state.allow_list(),
                &state.proxy_endpoint,
            );
            Ok(html_response(rewrite_document(&page.body, &ctx)))
        }
        Err(fetch_error) => {
            fetch_error.log_diagnostics();
            if !state.allow_list().allows_url(&target) {
                return Err(ProxyError::Unreachable {
                    target,
                    source: fetch_error,
                }
                .into());
            }

            info!(%target, "plain fetch failed, trying headless render");
            match state.renderer.render(&target).await {
                Ok(rendered) => {
                    // The rendered DOM comes without response headers to judge.
                    let frame = FramePolicy::ALLOWED;
                    let policy = RewritePolicy::derive(embed_requested, true, frame);
                    let ctx = RewriteContext::new(
                        &target,
                        policy,
                        frame,
                        state.allow_list(),
                        &state.proxy_endpoint,
                    );
                    Ok(html_response(rewrite_document(&rendered, &ctx)))
                }
                Err(render_error) => {
                    warn!(%target, "headless render failed: {}", render_error);
                    Err(ProxyError::Unreachable {
                        target,
                        source: fetch_error,
                    }
                    .into())
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub ok: bool,
    pub final_url: String,
    pub frame_allowed: bool,
}

// GET /api/proxy/info?url=...
async fn info_handler(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<InfoResponse>, JsonError> {
    let target = ProxyQuery::from(pairs).target()?;

    let (final_url, headers): (Url, _) = fetch::resolve_final(&state.info_client, &target)
        .await
        .map_err(|source| {
            source.log_diagnostics();
            ProxyError::Unreachable {
                target: target.clone(),
                source,
            }
        })?;

    let frame = FramePolicy::evaluate(&headers, &final_url, &state.config().proxy_origin());
    info!(%target, %final_url, frame_allowed = frame.frame_allowed(), "resolved target");

    Ok(Json(InfoResponse {
        ok: true,
        final_url: final_url.to_string(),
        frame_allowed: frame.frame_allowed(),
    }))
}

#[derive(Debug, Serialize)]
pub struct WhitelistResponse {
    pub ok: bool,
    pub whitelist: Vec<String>,
}

// GET /api/embed/whitelist
async fn whitelist_handler(State(state): State<AppState>) -> Json<WhitelistResponse> {
    Json(WhitelistResponse {
        ok: true,
        whitelist: state.allow_list().hosts().to_vec(),
    })
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "OK" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> ProxyQuery {
        ProxyQuery::from(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn embed_flag_only_accepts_one() {
        assert!(query(&[("embed", "1")]).embed_requested());
        assert!(!query(&[("embed", "0")]).embed_requested());
        assert!(!query(&[("embed", "true")]).embed_requested());
        assert!(!query(&[]).embed_requested());
    }

    #[test]
    fn plain_links_keep_the_target_query() {
        let q = query(&[("url", "https://news.test/a?b=1"), ("embed", "1")]);
        assert_eq!(q.target().unwrap().as_str(), "https://news.test/a?b=1");
    }

    #[test]
    fn form_fields_replace_the_target_query() {
        let q = query(&[
            ("url", "https://news.test/search?lang=en"),
            ("q", "rust lang"),
            ("url", "a field named url"),
        ]);
        assert_eq!(
            q.target().unwrap().as_str(),
            "https://news.test/search?q=rust+lang&url=a+field+named+url"
        );
    }

    #[test]
    fn state_uses_the_configured_endpoint() {
        let state = AppState::with_renderer(
            ProxyConfig::default(),
            Arc::new(crate::headless::DisabledRenderer),
        )
        .unwrap();
        assert_eq!(&*state.proxy_endpoint, "http://localhost:3000/api/proxy");
    }

    #[test]
    fn cors_layer_builds_from_config() {
        let _layer = cors_layer(&ProxyConfig::default().cors_origins);
    }
}
