//! Start-up configuration.
//!
//! Every setting is a command-line flag that can also come from the
//! environment (`.env.local` / `.env` are loaded by the binary first).
//! [`ServerArgs`] is validated once into a [`ProxyConfig`], which is then
//! shared read-only by all request handlers.

use crate::allowlist::{AllowList, DEFAULT_EMBED_WHITELIST};
use crate::headless::HeadlessOptions;
use crate::proxy::PROXY_PATH;
use axum::http::HeaderValue;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::{Origin, Url};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_CORS_ORIGINS: &str = "http://localhost:5173,http://localhost:5174";
pub const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PUBLIC_ORIGIN {value:?} is invalid: {reason}")]
    PublicOrigin { value: String, reason: String },

    #[error("CORS origin {0:?} is not a valid header value")]
    CorsOrigin(String),

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}

#[derive(Debug, Clone, Parser)]
#[command(name = "canvas-web-proxy", version, about = "Forwarding HTML proxy for the canvas front-end")]
pub struct ServerArgs {
    /// Address to bind
    #[arg(long, env = "BIND_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// Port to bind
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Origin browsers use to reach this server (default: http://localhost:<port>)
    #[arg(long, env = "PUBLIC_ORIGIN")]
    pub public_origin: Option<String>,

    /// Comma-separated hosts allowed script-preserving embeds
    #[arg(long, env = "EMBED_WHITELIST", default_value = DEFAULT_EMBED_WHITELIST)]
    pub embed_whitelist: String,

    /// Comma-separated origins allowed by CORS
    #[arg(long, env = "CORS_ORIGINS", default_value = DEFAULT_CORS_ORIGINS)]
    pub cors_origins: String,

    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = 30)]
    pub fetch_timeout_secs: u64,

    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Largest upstream document accepted, in bytes
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    #[arg(long, env = "HEADLESS_TIMEOUT_SECS", default_value_t = 30)]
    pub headless_timeout_secs: u64,

    /// Chrome/Chromium binary for the headless fallback
    #[arg(long, env = "CHROME_EXECUTABLE")]
    pub chrome_executable: Option<PathBuf>,

    /// Launch Chrome with --no-sandbox (containers)
    #[arg(long, env = "HEADLESS_NO_SANDBOX")]
    pub headless_no_sandbox: bool,
}

/// Validated, immutable server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    /// `scheme://host[:port]` this server is reached at.
    pub public_origin: Url,
    pub allow_list: AllowList,
    pub cors_origins: Vec<HeaderValue>,
    pub fetch_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_body_bytes: usize,
    pub headless: HeadlessOptions,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let public_origin = format!("http://localhost:{}", DEFAULT_PORT);
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            public_origin: parse_public_origin(&public_origin).expect("default origin is valid"),
            allow_list: AllowList::parse(DEFAULT_EMBED_WHITELIST),
            cors_origins: parse_cors_origins(DEFAULT_CORS_ORIGINS).unwrap_or_default(),
            fetch_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            headless: HeadlessOptions::default(),
        }
    }
}

impl ProxyConfig {
    pub fn proxy_origin(&self) -> Origin {
        self.public_origin.origin()
    }

    /// Absolute URL of the proxy endpoint, as written into rewritten links.
    pub fn proxy_endpoint(&self) -> String {
        format!("{}{}", self.public_origin.origin().ascii_serialization(), PROXY_PATH)
    }
}

fn parse_public_origin(value: &str) -> Result<Url, ConfigError> {
    let err = |reason: &str| ConfigError::PublicOrigin {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let url = Url::parse(value.trim()).map_err(|e| err(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(err("expected http(s)://host[:port]"));
    }
    Url::parse(&url.origin().ascii_serialization()).map_err(|e| err(&e.to_string()))
}

fn parse_cors_origins(raw: &str) -> Result<Vec<HeaderValue>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(|o| HeaderValue::from_str(o).map_err(|_| ConfigError::CorsOrigin(o.to_string())))
        .collect()
}

fn non_zero(name: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { name })
    } else {
        Ok(value)
    }
}

impl TryFrom<ServerArgs> for ProxyConfig {
    type Error = ConfigError;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let public_origin = match &args.public_origin {
            Some(origin) => parse_public_origin(origin)?,
            None => parse_public_origin(&format!("http://localhost:{}", args.port))?,
        };
        let max_body_bytes = non_zero("MAX_BODY_BYTES", args.max_body_bytes as u64)? as usize;

        Ok(Self {
            bind_addr: SocketAddr::new(args.host, args.port),
            public_origin,
            allow_list: AllowList::parse(&args.embed_whitelist),
            cors_origins: parse_cors_origins(&args.cors_origins)?,
            fetch_timeout: Duration::from_secs(non_zero("FETCH_TIMEOUT_SECS", args.fetch_timeout_secs)?),
            connect_timeout: Duration::from_secs(non_zero(
                "CONNECT_TIMEOUT_SECS",
                args.connect_timeout_secs,
            )?),
            max_body_bytes,
            headless: HeadlessOptions {
                timeout: Duration::from_secs(non_zero(
                    "HEADLESS_TIMEOUT_SECS",
                    args.headless_timeout_secs,
                )?),
                chrome_executable: args.chrome_executable,
                no_sandbox: args.headless_no_sandbox,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> ServerArgs {
        let mut argv = vec!["canvas-web-proxy"];
        argv.extend_from_slice(extra);
        ServerArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn whitelist_flag_is_normalized() {
        let config = ProxyConfig::try_from(args(&["--embed-whitelist", "Example.com, WWW.Foo.org"])).unwrap();
        assert_eq!(config.allow_list.hosts(), &["example.com".to_string(), "foo.org".to_string()]);
    }

    #[test]
    fn public_origin_defaults_to_local_port() {
        let config = ProxyConfig::try_from(args(&["--port", "8080", "--public-origin", ""]));
        assert!(config.is_err(), "empty origin is rejected");

        let config = ProxyConfig::try_from(ServerArgs {
            public_origin: None,
            ..args(&["--port", "8080"])
        })
        .unwrap();
        assert_eq!(config.proxy_endpoint(), "http://localhost:8080/api/proxy");
    }

    #[test]
    fn public_origin_drops_path() {
        let config = ProxyConfig::try_from(ServerArgs {
            public_origin: Some("https://canvas.test/app/".to_string()),
            ..args(&[])
        })
        .unwrap();
        assert_eq!(config.proxy_endpoint(), "https://canvas.test/api/proxy");
        assert_eq!(config.proxy_origin(), Url::parse("https://canvas.test").unwrap().origin());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = ProxyConfig::try_from(ServerArgs {
            max_body_bytes: 0,
            ..args(&[])
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Zero { name: "MAX_BODY_BYTES" }));
    }

    #[test]
    fn default_config_is_usable() {
        let config = ProxyConfig::default();
        assert_eq!(config.proxy_endpoint(), "http://localhost:3000/api/proxy");
        assert_eq!(config.cors_origins.len(), 2);
        assert!(config.allow_list.contains_host("youtube.com"));
    }
}
