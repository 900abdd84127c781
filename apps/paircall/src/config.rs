use std::env;
#[cfg(test)]
use std::sync::Mutex;

/// Paircall client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// The relay server address (defaults to "127.0.0.1:8080")
    pub relay_server: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let server =
            env::var("PAIRCALL_RELAY_SERVER").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let server = if server.starts_with("localhost:") {
            server.replacen("localhost", "127.0.0.1", 1)
        } else {
            server
        };
        Self {
            relay_server: server,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_server: "127.0.0.1:8080".to_string(),
        }
    }
}
