use std::net::SocketAddr;

use resticd_engine::EngineConfig;
use tracing::warn;

/// HTTP server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token required on every `/api` route when set.
    pub api_token: Option<String>,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            api_token: None,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            engine: EngineConfig::from_env(),
            ..Self::default()
        };

        if let Ok(host) = std::env::var("RESTICD_HOST") {
            if !host.trim().is_empty() {
                config.host = host.trim().to_string();
            }
        }
        if let Ok(raw) = std::env::var("RESTICD_PORT") {
            match raw.trim().parse() {
                Ok(port) => config.port = port,
                Err(_) => warn!(value = %raw, "Ignoring invalid RESTICD_PORT"),
            }
        }
        config.api_token = std::env::var("RESTICD_API_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());

        config
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}
