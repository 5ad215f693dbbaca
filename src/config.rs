//! Relay configuration.
//!
//! Settings come from three layers, highest precedence first:
//!
//! 1. CLI flags / environment variables (`clap` with `env`)
//! 2. TOML config file (`--config`, or `$CONFIGURATION_DIRECTORY/mqtt-rest-relay.toml`)
//! 3. Built-in defaults
//!
//! ```toml
//! [http]
//! host = "0.0.0.0"
//! port = 8080
//! user = "admin"
//! pass = "secret"
//!
//! [mqtt]
//! host = "127.0.0.1"
//! port = 1883
//! sub = "sensors/temp sensors/humidity"
//! pub = "actors/valve"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use rumqttc::QoS;
use serde::Deserialize;

use crate::error::{RelayError, Result};
use crate::state::DEFAULT_REALM;
use crate::topic::{self, TopicRole};

/// File name looked up inside `$CONFIGURATION_DIRECTORY`.
pub const CONFIG_FILE_NAME: &str = "mqtt-rest-relay.toml";

const DEFAULT_HTTP_HOST: &str = "0.0.0.0";
const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_MQTT_HOST: &str = "127.0.0.1";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 10;
const CLIENT_ID_PREFIX: &str = "mqtt-rest-relay";

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug, Default)]
#[command(name = "mqtt-rest-relay", version, about = "MQTT ↔ HTTP relay")]
pub struct Args {
    /// Path to a TOML config file
    #[arg(short, long, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// HTTP bind address
    #[arg(long, env = "HTTP_HOST")]
    pub http_host: Option<String>,

    /// HTTP port
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// HTTP basic auth user (auth is disabled when user and password are empty)
    #[arg(long, env = "HTTP_USER")]
    pub http_user: Option<String>,

    /// HTTP basic auth password
    #[arg(long, env = "HTTP_PASS", hide_env_values = true)]
    pub http_pass: Option<String>,

    /// Realm announced in the WWW-Authenticate challenge
    #[arg(long, env = "HTTP_REALM")]
    pub realm: Option<String>,

    /// Maximum accepted POST body size in bytes
    #[arg(long, env = "HTTP_MAX_BODY_BYTES")]
    pub max_body_bytes: Option<usize>,

    /// MQTT broker host
    #[arg(long, env = "MQTT_HOST")]
    pub mqtt_host: Option<String>,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT")]
    pub mqtt_port: Option<u16>,

    /// MQTT user
    #[arg(long, env = "MQTT_USER")]
    pub mqtt_user: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASS", hide_env_values = true)]
    pub mqtt_pass: Option<String>,

    /// MQTT client id. Defaults to "mqtt-rest-relay-" plus 7 random digits.
    #[arg(long, env = "MQTT_CLIENT_ID")]
    pub client_id: Option<String>,

    /// MQTT keep-alive interval in seconds
    #[arg(long, env = "MQTT_KEEP_ALIVE_SECS")]
    pub keep_alive_secs: Option<u64>,

    /// Whitespace-separated topics to subscribe to (served via GET)
    #[arg(long = "sub", env = "MQTT_SUB")]
    pub sub: Option<String>,

    /// Whitespace-separated topics that accept POST (published to MQTT)
    #[arg(long = "pub", env = "MQTT_PUB")]
    pub publish: Option<String>,

    /// QoS for outbound publishes (0, 1 or 2)
    #[arg(long, env = "MQTT_PUBLISH_QOS")]
    pub publish_qos: Option<u8>,

    /// QoS for subscriptions (0, 1 or 2)
    #[arg(long, env = "MQTT_SUBSCRIBE_QOS")]
    pub subscribe_qos: Option<u8>,

    /// Set the retain flag on outbound publishes
    #[arg(long, env = "MQTT_RETAIN")]
    pub retain: Option<bool>,

    /// Seconds to wait for the broker to confirm a publish
    #[arg(long, env = "MQTT_PUBLISH_TIMEOUT_SECS")]
    pub publish_timeout_secs: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

// ── Config File ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub mqtt: MqttSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub realm: Option<String>,
    pub max_body_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub sub: Option<String>,
    #[serde(rename = "pub")]
    pub publish: Option<String>,
    pub publish_qos: Option<u8>,
    pub subscribe_qos: Option<u8>,
    pub retain: Option<bool>,
    pub publish_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn parse(path: &Path, contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|source| RelayError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the config file if one applies.
    ///
    /// An explicit path must exist. The implicit
    /// `$CONFIGURATION_DIRECTORY` file is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Option<Self>> {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => match std::env::var_os("CONFIGURATION_DIRECTORY") {
                Some(dir) => (PathBuf::from(dir).join(CONFIG_FILE_NAME), false),
                None => return Ok(None),
            },
        };

        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using flags and environment");
            return Ok(None);
        }

        tracing::info!(path = %path.display(), "Config file");
        let contents = std::fs::read_to_string(&path).map_err(|source| RelayError::ConfigRead {
            path: path.clone(),
            source,
        })?;
        Self::parse(&path, &contents).map(Some)
    }
}

// ── Resolved Config ───────────────────────────────────────────────────────────

/// HTTP side settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub realm: String,
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HTTP_HOST.to_string(),
            port: DEFAULT_HTTP_PORT,
            user: String::new(),
            pass: String::new(),
            realm: DEFAULT_REALM.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl HttpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Broker side settings. Topic lists are already filtered.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub subscribe_topics: Vec<String>,
    pub publish_topics: Vec<String>,
    pub publish_qos: QoS,
    pub subscribe_qos: QoS,
    pub retain: bool,
    pub publish_timeout: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_MQTT_HOST.to_string(),
            port: DEFAULT_MQTT_PORT,
            user: String::new(),
            pass: String::new(),
            client_id: random_client_id(),
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            subscribe_topics: Vec::new(),
            publish_topics: Vec::new(),
            publish_qos: QoS::AtMostOnce,
            subscribe_qos: QoS::AtMostOnce,
            retain: false,
            publish_timeout: Duration::from_secs(DEFAULT_PUBLISH_TIMEOUT_SECS),
        }
    }
}

/// Fully resolved relay configuration.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub http: HttpConfig,
    pub mqtt: MqttConfig,
}

impl RelayConfig {
    /// Resolve from CLI/env, reading the config file if one applies.
    pub fn load(args: &Args) -> Result<Self> {
        let file = FileConfig::load(args.config.as_deref())?.unwrap_or_default();
        Self::resolve(args, file)
    }

    /// Merge CLI/env over the file over defaults.
    pub fn resolve(args: &Args, file: FileConfig) -> Result<Self> {
        let FileConfig { http, mqtt } = file;
        let http_defaults = HttpConfig::default();
        let mqtt_defaults = MqttConfig::default();

        let http = HttpConfig {
            host: pick(args.http_host.clone(), http.host, http_defaults.host),
            port: pick(args.http_port, http.port, http_defaults.port),
            user: trimmed(pick(args.http_user.clone(), http.user, http_defaults.user)),
            pass: trimmed(pick(args.http_pass.clone(), http.pass, http_defaults.pass)),
            realm: pick(args.realm.clone(), http.realm, http_defaults.realm),
            max_body_bytes: pick(args.max_body_bytes, http.max_body_bytes, http_defaults.max_body_bytes),
        };

        let sub = pick(args.sub.clone(), mqtt.sub, String::new());
        let publish = pick(args.publish.clone(), mqtt.publish, String::new());
        let timeout_secs = pick(
            args.publish_timeout_secs,
            mqtt.publish_timeout_secs,
            DEFAULT_PUBLISH_TIMEOUT_SECS,
        );

        let mqtt = MqttConfig {
            host: pick(args.mqtt_host.clone(), mqtt.host, mqtt_defaults.host),
            port: pick(args.mqtt_port, mqtt.port, mqtt_defaults.port),
            user: trimmed(pick(args.mqtt_user.clone(), mqtt.user, mqtt_defaults.user)),
            pass: trimmed(pick(args.mqtt_pass.clone(), mqtt.pass, mqtt_defaults.pass)),
            client_id: pick(args.client_id.clone(), mqtt.client_id, mqtt_defaults.client_id),
            keep_alive_secs: pick(args.keep_alive_secs, mqtt.keep_alive_secs, mqtt_defaults.keep_alive_secs),
            subscribe_topics: topic::accept_topics(&sub, TopicRole::Subscribe),
            publish_topics: topic::accept_topics(&publish, TopicRole::Publish),
            publish_qos: parse_qos(pick(args.publish_qos, mqtt.publish_qos, 0))?,
            subscribe_qos: parse_qos(pick(args.subscribe_qos, mqtt.subscribe_qos, 0))?,
            retain: pick(args.retain, mqtt.retain, mqtt_defaults.retain),
            publish_timeout: Duration::from_secs(timeout_secs.max(1)),
        };

        if mqtt.subscribe_topics.is_empty() && mqtt.publish_topics.is_empty() {
            tracing::warn!("No topics configured, every request will return 404");
        }

        Ok(Self { http, mqtt })
    }
}

fn pick<T>(flag: Option<T>, file: Option<T>, default: T) -> T {
    flag.or(file).unwrap_or(default)
}

fn trimmed(value: String) -> String {
    value.trim().to_string()
}

/// Map a numeric QoS level to the rumqttc enum.
pub fn parse_qos(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(RelayError::InvalidQos(other)),
    }
}

/// `mqtt-rest-relay-` followed by 7 random digits.
pub fn random_client_id() -> String {
    let digits: u32 = rand::thread_rng().gen_range(0..10_000_000);
    format!("{CLIENT_ID_PREFIX}-{digits:07}")
}
