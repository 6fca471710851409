//! Forwarding HTML proxy for the canvas front-end.
//!
//! Fetches third-party pages on behalf of the browser, neutralizes their
//! framing restrictions, strips or keeps scripts depending on the embed
//! allow-list, and rewrites links so in-frame navigation stays proxied.
//! Pages that refuse plain fetches can be rendered with a headless browser
//! when their host is allow-listed.

pub mod allowlist;
pub mod config;
pub mod error;
pub mod fetch;
pub mod frame_policy;
pub mod headless;
pub mod proxy;
pub mod rewrite;

pub use allowlist::AllowList;
pub use config::{ProxyConfig, ServerArgs};
pub use error::ProxyError;
pub use frame_policy::FramePolicy;
pub use headless::{PageRenderer, RenderError};
pub use proxy::{build_router, start_proxy_server, AppState};
pub use rewrite::{rewrite_document, RewriteContext, RewritePolicy};
