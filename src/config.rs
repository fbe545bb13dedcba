use crate::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;

pub const DEFAULT_SIP_PORT: u16 = 5060;
pub const DEFAULT_EXPIRES: u32 = 3600;
pub const DEFAULT_MIN_MEDIA_PORT: u16 = 20000;
pub const DEFAULT_MAX_MEDIA_PORT: u16 = 21000;

/// Runtime configuration assembled from an external string key/value store.
///
/// Recognized keys:
///
/// * `sip.username`, `sip.domain`, `sip.password` - registrar account
/// * `sip.server` - registrar address, defaults to `sip.domain`
/// * `sip.expires` - registration lifetime in seconds
/// * `ice.stun_server`, `ice.turn_server` - candidate gathering servers
/// * `ice.min_port`, `ice.max_port` - media port pool bounds
#[derive(Debug, Clone)]
pub struct Config {
    pub username: Option<String>,
    pub domain: Option<String>,
    pub password: Option<String>,
    pub server: Option<String>,
    pub expires: u32,
    pub stun_server: Option<SocketAddr>,
    pub turn_server: Option<SocketAddr>,
    pub min_media_port: u16,
    pub max_media_port: u16,
    /// Gather on loopback interfaces too; off unless explicitly set.
    pub allow_loopback: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            username: None,
            domain: None,
            password: None,
            server: None,
            expires: DEFAULT_EXPIRES,
            stun_server: None,
            turn_server: None,
            min_media_port: DEFAULT_MIN_MEDIA_PORT,
            max_media_port: DEFAULT_MAX_MEDIA_PORT,
            allow_loopback: false,
        }
    }
}

impl Config {
    pub fn from_settings(settings: &HashMap<String, String>) -> Result<Self> {
        let mut config = Config::default();

        config.username = settings.get("sip.username").cloned();
        config.domain = settings.get("sip.domain").cloned();
        config.password = settings.get("sip.password").cloned();
        config.server = settings
            .get("sip.server")
            .cloned()
            .or_else(|| config.domain.clone());

        if let Some(expires) = settings.get("sip.expires") {
            config.expires = expires
                .parse()
                .map_err(|_| Error::ConfigError(format!("bad sip.expires: {}", expires)))?;
        }

        if let Some(server) = settings.get("ice.stun_server") {
            config.stun_server = Some(
                server
                    .parse()
                    .map_err(|_| Error::ConfigError(format!("bad ice.stun_server: {}", server)))?,
            );
        }
        if let Some(server) = settings.get("ice.turn_server") {
            config.turn_server = Some(
                server
                    .parse()
                    .map_err(|_| Error::ConfigError(format!("bad ice.turn_server: {}", server)))?,
            );
        }

        if let Some(allow) = settings.get("ice.allow_loopback") {
            config.allow_loopback = allow == "true" || allow == "1";
        }
        if let Some(port) = settings.get("ice.min_port") {
            config.min_media_port = port.parse()?;
        }
        if let Some(port) = settings.get("ice.max_port") {
            config.max_media_port = port.parse()?;
        }
        if config.min_media_port >= config.max_media_port {
            return Err(Error::ConfigError(format!(
                "media port range is empty: [{}, {}]",
                config.min_media_port, config.max_media_port
            )));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let mut settings = HashMap::new();
        settings.insert("sip.username".to_string(), "alice".to_string());
        settings.insert("sip.domain".to_string(), "example.test".to_string());
        settings.insert("ice.stun_server".to_string(), "198.51.100.1:3478".to_string());

        let config = Config::from_settings(&settings).expect("valid settings");
        assert_eq!(config.username.as_deref(), Some("alice"));
        assert_eq!(config.server.as_deref(), Some("example.test"));
        assert_eq!(config.expires, DEFAULT_EXPIRES);
        assert!(config.stun_server.is_some());
    }

    #[test]
    fn test_empty_port_range_rejected() {
        let mut settings = HashMap::new();
        settings.insert("ice.min_port".to_string(), "30000".to_string());
        settings.insert("ice.max_port".to_string(), "30000".to_string());
        assert!(Config::from_settings(&settings).is_err());
    }
}
