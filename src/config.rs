//! Runtime settings
//!
//! Loaded from an optional TOML file, then overridden from the command line.
//! Every `require_*` accessor validates one value before any session state
//! is created.

use std::io::{BufRead, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::relay::DEFAULT_RELAY_PORT;
use crate::DEFAULT_MTU;

pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub signaling_url: Option<String>,
    pub room: Option<String>,
    pub interface: Option<String>,
    pub mtu: usize,
    /// `None` disables the reflexive candidate.
    pub stun_server: Option<String>,
    pub host_ip: Option<IpAddr>,
    pub negotiation_timeout_secs: u64,
    pub relay_addr: Option<String>,
    pub relay_bind: String,
    pub relay_idle_timeout_secs: Option<u64>,
    pub backend_url: Option<String>,
    pub direct_port: u16,
    pub public_ip: Option<String>,
    pub keepalive_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            signaling_url: None,
            room: None,
            interface: None,
            mtu: DEFAULT_MTU,
            stun_server: Some(DEFAULT_STUN_SERVER.to_string()),
            host_ip: None,
            negotiation_timeout_secs: 30,
            relay_addr: None,
            relay_bind: format!("0.0.0.0:{DEFAULT_RELAY_PORT}"),
            relay_idle_timeout_secs: None,
            backend_url: None,
            direct_port: DEFAULT_RELAY_PORT,
            public_ip: None,
            keepalive_secs: 10,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Settings::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Settings, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn require_signaling_url(&self) -> Result<&str, ConfigError> {
        let url = required("signaling_url", &self.signaling_url)?;
        if !url.starts_with("ws://") {
            return Err(ConfigError::Invalid {
                field: "signaling_url",
                reason: format!("{url} is not a ws:// URL"),
            });
        }
        Ok(url)
    }

    pub fn require_interface(&self) -> Result<&str, ConfigError> {
        required("interface", &self.interface)
    }

    pub fn require_backend_url(&self) -> Result<&str, ConfigError> {
        let url = required("backend_url", &self.backend_url)?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "backend_url",
                reason: format!("{url} is not an http(s) URL"),
            });
        }
        Ok(url)
    }

    pub fn require_relay_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = required("relay_addr", &self.relay_addr)?;
        resolve("relay_addr", addr)
    }

    pub fn relay_bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        check_placeholder("relay_bind", &self.relay_bind)?;
        resolve("relay_bind", &self.relay_bind)
    }

    pub fn require_mtu(&self) -> Result<usize, ConfigError> {
        if !(576..=9000).contains(&self.mtu) {
            return Err(ConfigError::Invalid {
                field: "mtu",
                reason: format!("{} is outside 576..=9000", self.mtu),
            });
        }
        Ok(self.mtu)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs.max(1))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn relay_idle_timeout(&self) -> Option<Duration> {
        self.relay_idle_timeout_secs.map(Duration::from_secs)
    }
}

fn required<'a>(field: &'static str, value: &'a Option<String>) -> Result<&'a str, ConfigError> {
    let value = value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(field))?;
    check_placeholder(field, value)?;
    Ok(value)
}

/// Template values such as `<relay-ip>:5001` or `CHANGE_ME` must be edited.
fn check_placeholder(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let templated = value.contains('<') && value.contains('>');
    if templated || value.contains("CHANGE_ME") {
        return Err(ConfigError::Placeholder {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn resolve(field: &'static str, addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.to_socket_addrs()
        .map_err(|e| ConfigError::Invalid {
            field,
            reason: format!("{addr}: {e}"),
        })?
        .next()
        .ok_or_else(|| ConfigError::Invalid {
            field,
            reason: format!("{addr} resolves to nothing"),
        })
}

/// Ask for the room on `output` and read one line from `input`.
pub fn prompt_room<R: BufRead, W: Write>(mut input: R, mut output: W) -> Result<String, ConfigError> {
    write!(output, "Room name: ")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    let room = line.trim();
    if room.is_empty() {
        return Err(ConfigError::Missing("room"));
    }
    Ok(room.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_defaults_apply_to_missing_keys() {
        let settings = Settings::from_toml_str(
            r#"
            signaling_url = "ws://rendezvous.example:8080"
            room = "lan-party"
            "#,
        )
        .unwrap();
        assert_eq!(settings.mtu, 1500);
        assert_eq!(settings.negotiation_timeout(), Duration::from_secs(30));
        assert_eq!(settings.stun_server.as_deref(), Some(DEFAULT_STUN_SERVER));
        assert!(settings.relay_idle_timeout().is_none());
        assert_eq!(settings.require_signaling_url().unwrap(), "ws://rendezvous.example:8080");
    }

    #[test]
    fn test_placeholder_endpoint_is_rejected() {
        let settings = Settings {
            relay_addr: Some("<relay-ip>:5001".into()),
            ..Default::default()
        };
        assert!(matches!(
            settings.require_relay_addr(),
            Err(ConfigError::Placeholder { field: "relay_addr", .. })
        ));

        let settings = Settings {
            signaling_url: Some("ws://CHANGE_ME:8080".into()),
            ..Default::default()
        };
        assert!(matches!(
            settings.require_signaling_url(),
            Err(ConfigError::Placeholder { .. })
        ));
    }

    #[test]
    fn test_missing_and_invalid_values() {
        let settings = Settings::default();
        assert!(matches!(
            settings.require_interface(),
            Err(ConfigError::Missing("interface"))
        ));

        let settings = Settings {
            signaling_url: Some("http://rendezvous.example".into()),
            relay_addr: Some("not an address".into()),
            mtu: 100,
            ..Default::default()
        };
        assert!(matches!(settings.require_signaling_url(), Err(ConfigError::Invalid { .. })));
        assert!(matches!(settings.require_relay_addr(), Err(ConfigError::Invalid { .. })));
        assert!(matches!(settings.require_mtu(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_relay_addr_resolves() {
        let settings = Settings {
            relay_addr: Some("127.0.0.1:5001".into()),
            ..Default::default()
        };
        assert_eq!(
            settings.require_relay_addr().unwrap(),
            "127.0.0.1:5001".parse().unwrap()
        );
        assert_eq!(
            settings.relay_bind_addr().unwrap(),
            "0.0.0.0:5001".parse().unwrap()
        );
    }

    #[test]
    fn test_prompt_reads_trimmed_room() {
        let mut out = Vec::new();
        let room = prompt_room(Cursor::new("  lan-party \n"), &mut out).unwrap();
        assert_eq!(room, "lan-party");
        assert_eq!(String::from_utf8(out).unwrap(), "Room name: ");

        let empty = prompt_room(Cursor::new("\n"), Vec::new());
        assert!(matches!(empty, Err(ConfigError::Missing("room"))));
    }
}
