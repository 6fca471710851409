//! Headless-browser rendering for pages that refuse plain HTTP fetches.
//!
//! Only used as a fallback for allow-listed hosts. Every render gets its own
//! browser process and profile directory, and both are torn down before the
//! call returns, whatever the outcome.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("headless rendering is not available in this build")]
    Unavailable,

    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: Url, message: String },

    #[error("rendering {url} timed out after {seconds}s")]
    Timeout { url: Url, seconds: u64 },
}

/// Produces the post-script DOM of a page.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &Url) -> Result<String, RenderError>;
}

/// Renderer used when the `headless` feature is compiled out.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledRenderer;

#[async_trait]
impl PageRenderer for DisabledRenderer {
    async fn render(&self, _url: &Url) -> Result<String, RenderError> {
        Err(RenderError::Unavailable)
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessOptions {
    pub timeout: Duration,
    pub chrome_executable: Option<std::path::PathBuf>,
    /// Needed inside most containers, where Chrome's own sandbox cannot start.
    pub no_sandbox: bool,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            chrome_executable: None,
            no_sandbox: false,
        }
    }
}

#[cfg(feature = "headless")]
pub use chromium::ChromiumRenderer;

#[cfg(feature = "headless")]
mod chromium {
    use super::{HeadlessOptions, PageRenderer, RenderError};
    use crate::fetch::{ACCEPT_LANGUAGE, USER_AGENT};
    use async_trait::async_trait;
    use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
    use chromiumoxide::cdp::browser_protocol::page::EventLifecycleEvent;
    use chromiumoxide::{Browser, BrowserConfig};
    use futures::StreamExt;
    use std::time::Duration;
    use tracing::{debug, info, warn};
    use url::Url;

    /// Lifecycle event Chrome fires once the frame has had no network
    /// activity for 500 ms.
    const NETWORK_IDLE: &str = "networkIdle";
    /// Pages that keep polling never go idle; read the DOM after this long.
    const NETWORK_IDLE_WAIT: Duration = Duration::from_secs(10);

    #[derive(Debug, Clone, Default)]
    pub struct ChromiumRenderer {
        options: HeadlessOptions,
    }

    impl ChromiumRenderer {
        pub fn new(options: HeadlessOptions) -> Self {
            Self { options }
        }

        fn browser_config(&self, profile: &std::path::Path) -> Result<BrowserConfig, RenderError> {
            let mut builder = BrowserConfig::builder()
                .user_data_dir(profile)
                .arg(format!("--user-agent={}", USER_AGENT))
                .arg("--disable-blink-features=AutomationControlled")
                .arg("--disable-dev-shm-usage")
                .arg("--no-first-run")
                .arg("--no-default-browser-check")
                .arg("--disable-background-networking")
                .arg("--disable-sync")
                .arg("--disable-gpu");

            if let Some(path) = &self.options.chrome_executable {
                builder = builder.chrome_executable(path);
            }
            if self.options.no_sandbox {
                builder = builder.no_sandbox();
            }

            builder.build().map_err(RenderError::Launch)
        }

        async fn extract(browser: &Browser, url: &Url) -> Result<String, RenderError> {
            let nav_err = |e: chromiumoxide::error::CdpError| RenderError::Navigation {
                url: url.clone(),
                message: e.to_string(),
            };

            let page = browser.new_page("about:blank").await.map_err(nav_err)?;

            let ua = SetUserAgentOverrideParams::builder()
                .user_agent(USER_AGENT)
                .accept_language(ACCEPT_LANGUAGE)
                .build()
                .map_err(|message| RenderError::Navigation {
                    url: url.clone(),
                    message,
                })?;
            page.execute(ua).await.map_err(nav_err)?;

            let mut lifecycle = page
                .event_listener::<EventLifecycleEvent>()
                .await
                .map_err(nav_err)?;

            debug!(%url, "headless navigation");
            page.goto(url.as_str()).await.map_err(nav_err)?;
            let main_frame = page.mainframe().await.map_err(nav_err)?;

            let idle = async {
                let mut loader = None;
                while let Some(event) = lifecycle.next().await {
                    if main_frame.as_ref() == Some(&event.frame_id)
                        && reached_network_idle(&mut loader, &event.name, &event.loader_id)
                    {
                        return;
                    }
                }
            };
            if tokio::time::timeout(NETWORK_IDLE_WAIT, idle).await.is_err() {
                debug!(%url, "network never went idle, reading the DOM anyway");
            }

            page.content().await.map_err(nav_err)
        }
    }

    /// Feed one main-frame lifecycle event. Only the latest navigation
    /// counts: `about:blank` and client-side redirects each start with their
    /// own `init`.
    fn reached_network_idle<L: Clone + PartialEq>(current: &mut Option<L>, name: &str, loader: &L) -> bool {
        if name == "init" {
            *current = Some(loader.clone());
            return false;
        }
        name == NETWORK_IDLE && current.as_ref() == Some(loader)
    }

    #[async_trait]
    impl PageRenderer for ChromiumRenderer {
        async fn render(&self, url: &Url) -> Result<String, RenderError> {
            let profile = tempfile::Builder::new()
                .prefix("canvas-proxy-chrome-")
                .tempdir()
                .map_err(|e| RenderError::Launch(e.to_string()))?;
            let config = self.browser_config(profile.path())?;

            info!(%url, "🧭 launching headless browser");
            let (mut browser, mut handler) = Browser::launch(config)
                .await
                .map_err(|e| RenderError::Launch(e.to_string()))?;

            let events = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
            });

            let result = tokio::time::timeout(self.options.timeout, Self::extract(&browser, url))
                .await
                .unwrap_or_else(|_| {
                    Err(RenderError::Timeout {
                        url: url.clone(),
                        seconds: self.options.timeout.as_secs(),
                    })
                });

            if let Err(e) = browser.close().await {
                warn!(%url, "closing headless browser failed: {}", e);
            }
            if let Err(e) = browser.wait().await {
                warn!(%url, "waiting for headless browser exit failed: {}", e);
            }
            events.abort();
            drop(profile);

            result
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn idle_only_counts_for_the_latest_navigation() {
            let mut loader = None;
            assert!(!reached_network_idle(&mut loader, NETWORK_IDLE, &"blank"));
            assert!(!reached_network_idle(&mut loader, "init", &"page"));
            assert!(!reached_network_idle(&mut loader, "load", &"page"));
            assert!(!reached_network_idle(&mut loader, NETWORK_IDLE, &"blank"));
            assert!(reached_network_idle(&mut loader, NETWORK_IDLE, &"page"));
        }

        #[test]
        fn client_redirect_restarts_the_wait() {
            let mut loader = None;
            reached_network_idle(&mut loader, "init", &"first");
            reached_network_idle(&mut loader, "init", &"second");
            assert!(!reached_network_idle(&mut loader, NETWORK_IDLE, &"first"));
            assert!(reached_network_idle(&mut loader, NETWORK_IDLE, &"second"));
        }
    }
}
