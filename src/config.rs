use std::{env, fs::read_to_string, net::IpAddr, path::PathBuf, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

/// Listener and static file options.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", default)]
pub struct Net {
    ///
    /// The address the hub binds to.
    ///
    pub host: IpAddr,
    ///
    /// Listen port. When unset, 8443 with TLS configured and 8080 without.
    ///
    pub port: Option<u16>,
    ///
    /// Static file root served to browsers alongside the signaling channel.
    ///
    pub public_dir: PathBuf,
}

impl Default for Net {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: None,
            public_dir: PathBuf::from("public"),
        }
    }
}

/// TURN relay advertised to clients.
///
/// The hub never relays media itself; it only derives short-lived
/// credentials against `secret` the way the TURN REST convention expects and
/// hands them out with the ICE configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", default)]
pub struct Turn {
    pub urls: Vec<String>,
    pub secret: Option<String>,
    #[serde(default = "Turn::username_ttl")]
    pub username_ttl_seconds: u64,
    pub relay_min_port: Option<u16>,
    pub relay_max_port: Option<u16>,
}

impl Turn {
    fn username_ttl() -> u64 {
        3600
    }

    /// Size of the configured relay port range, when both ends are known.
    pub fn relay_ports_total(&self) -> Option<u32> {
        match (self.relay_min_port, self.relay_max_port) {
            (Some(min), Some(max)) if max >= min => Some(u32::from(max) - u32::from(min) + 1),
            _ => None,
        }
    }
}

impl Default for Turn {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            secret: None,
            username_ttl_seconds: Self::username_ttl(),
            relay_min_port: None,
            relay_max_port: None,
        }
    }
}

/// TLS configuration. Serving switches to TLS only when both paths are set.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct Tls {
    pub key_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
}

impl Tls {
    pub fn enabled(&self) -> bool {
        self.key_path.is_some() && self.cert_path.is_some()
    }
}

/// Web Push (VAPID) configuration. The sink is enabled only when both keys
/// are present.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct Push {
    pub vapid_public_key: Option<String>,
    pub vapid_private_key: Option<String>,
    pub vapid_subject: Option<String>,
}

impl Push {
    pub fn enabled(&self) -> bool {
        self.vapid_public_key.is_some() && self.vapid_private_key.is_some()
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", default)]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    pub level: LogLevel,
    ///
    /// Whether a configuration summary is logged on startup.
    ///
    pub startup: bool,
}

impl Default for Log {
    fn default() -> Self {
        Self { level: LogLevel::default(), startup: true }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub net: Net,
    pub turn: Turn,
    pub tls: Tls,
    pub push: Push,
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: voice-hub --config /etc/voice-hub/config.json
    ///
    #[arg(long, short)]
    config: Option<PathBuf>,
}

impl Config {
    ///
    /// Load configuration from an optional JSON5 file and the environment.
    ///
    /// Environment variables override file values so a containerized
    /// deployment can run without any file at all.
    ///
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();

        let mut config = match &cli.config {
            Some(path) => serde_json5::from_str::<Self>(&read_to_string(path)?)?,
            None => Self::default(),
        };

        config.apply_env()?;
        Ok(config)
    }

    /// The effective listen port.
    pub fn port(&self) -> u16 {
        self.net.port.unwrap_or(if self.tls.enabled() { 8443 } else { 8080 })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = env::var("HOST") {
            self.net.host = value.parse()?;
        }
        if let Ok(value) = env::var("PORT") {
            self.net.port = Some(value.parse()?);
        }
        if let Ok(value) = env::var("PUBLIC_DIR") {
            self.net.public_dir = PathBuf::from(value);
        }

        if let Ok(value) = env::var("TURN_URLS") {
            self.turn.urls = value
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(value) = env::var("TURN_SECRET") {
            self.turn.secret = Some(value);
        }
        if let Ok(value) = env::var("TURN_USERNAME_TTL_SECONDS") {
            self.turn.username_ttl_seconds = value.parse()?;
        }
        if let Ok(value) = env::var("TURN_RELAY_MIN_PORT") {
            self.turn.relay_min_port = Some(value.parse()?);
        }
        if let Ok(value) = env::var("TURN_RELAY_MAX_PORT") {
            self.turn.relay_max_port = Some(value.parse()?);
        }

        if let Ok(value) = env::var("TLS_KEY_PATH") {
            self.tls.key_path = Some(PathBuf::from(value));
        }
        if let Ok(value) = env::var("TLS_CERT_PATH") {
            self.tls.cert_path = Some(PathBuf::from(value));
        }

        if let Ok(value) = env::var("VAPID_PUBLIC_KEY") {
            self.push.vapid_public_key = Some(value);
        }
        if let Ok(value) = env::var("VAPID_PRIVATE_KEY") {
            self.push.vapid_private_key = Some(value);
        }
        if let Ok(value) = env::var("VAPID_SUBJECT") {
            self.push.vapid_subject = Some(value);
        }

        if let Ok(value) = env::var("STARTUP_LOG") {
            self.log.startup = value != "0" && !value.eq_ignore_ascii_case("false");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_follow_tls() {
        let mut config = Config::default();
        assert_eq!(config.port(), 8080);

        config.tls.key_path = Some(PathBuf::from("key.pem"));
        config.tls.cert_path = Some(PathBuf::from("cert.pem"));
        assert_eq!(config.port(), 8443);

        config.net.port = Some(9000);
        assert_eq!(config.port(), 9000);
    }

    #[test]
    fn relay_port_range_size() {
        let mut turn = Turn::default();
        assert_eq!(turn.relay_ports_total(), None);

        turn.relay_min_port = Some(49152);
        turn.relay_max_port = Some(49251);
        assert_eq!(turn.relay_ports_total(), Some(100));

        turn.relay_max_port = Some(49152);
        assert_eq!(turn.relay_ports_total(), Some(1));

        turn.relay_max_port = Some(40000);
        assert_eq!(turn.relay_ports_total(), None);
    }

    #[test]
    fn config_file_shape() {
        let config: Config = serde_json5::from_str(
            r#"{
                net: { host: "127.0.0.1", port: 9443, "public-dir": "www" },
                turn: { urls: ["turn:turn.example.org:3478"], secret: "s3cret" },
                log: { level: "debug", startup: false },
            }"#,
        )
        .unwrap();

        assert_eq!(config.net.port, Some(9443));
        assert_eq!(config.net.public_dir, PathBuf::from("www"));
        assert_eq!(config.turn.urls.len(), 1);
        assert_eq!(config.turn.username_ttl_seconds, 3600);
        assert!(!config.log.startup);
    }
}
