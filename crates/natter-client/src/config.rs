// Connection settings: defaults, environment overrides and an optional YAML file.
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4222;
pub const DEFAULT_CLIENT_NAME: &str = "natter";
/// Applied when the server advertises no usable `max_payload`.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024; // 1 MiB

const DEFAULT_SPIN_WAIT: Duration = Duration::from_millis(500);
const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(100);
const DEFAULT_IDLE_HEARTBEAT_THRESHOLD: u32 = 5;
const DEFAULT_HANDSHAKE_CYCLE_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_HANDSHAKE_MAX_DURATION: Duration = Duration::from_secs(2);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// A candidate server address.
///
/// Parses `host`, `host:port`, `[v6]:port` and bare IPv6 literals; the port
/// defaults to 4222.
///
/// ```
/// use natter_client::Host;
///
/// let host: Host = "[::1]:4333".parse().expect("host");
/// assert_eq!(host.address, "::1");
/// assert_eq!(host.port, 4333);
/// assert_eq!(host.to_string(), "[::1]:4333");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    pub address: String,
    pub port: u16,
}

impl Host {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

impl FromStr for Host {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            bail!("empty host");
        }
        if let Some(bracketed) = value.strip_prefix('[') {
            let Some((address, rest)) = bracketed.split_once(']') else {
                bail!("unterminated IPv6 literal: {value}");
            };
            let port = match rest {
                "" => DEFAULT_PORT,
                _ => match rest.strip_prefix(':') {
                    Some(port) => parse_port(port)?,
                    None => bail!("unexpected text after IPv6 literal: {value}"),
                },
            };
            return Ok(Self::new(address, port));
        }
        if value.matches(':').count() > 1 {
            return Ok(Self::new(value, DEFAULT_PORT));
        }
        match value.split_once(':') {
            Some((address, port)) if !address.is_empty() => {
                Ok(Self::new(address, parse_port(port)?))
            }
            Some(_) => bail!("missing address: {value}"),
            None => Ok(Self::new(value, DEFAULT_PORT)),
        }
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .with_context(|| format!("invalid port: {value}"))
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .finish()
    }
}

/// Timing of the background read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerTuning {
    /// Longest single wait for inbound bytes.
    pub spin_wait: Duration,
    /// Pause after an empty spin window.
    pub idle_wait: Duration,
    /// Consecutive empty windows before a `PING` probes the peer.
    pub idle_heartbeat_threshold: u32,
}

impl Default for ConsumerTuning {
    fn default() -> Self {
        Self {
            spin_wait: DEFAULT_SPIN_WAIT,
            idle_wait: DEFAULT_IDLE_WAIT,
            idle_heartbeat_threshold: DEFAULT_IDLE_HEARTBEAT_THRESHOLD,
        }
    }
}

/// Timing of socket acquisition and the wait for the server's `INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTuning {
    pub cycle_delay: Duration,
    pub max_duration: Duration,
    pub connect_timeout: Duration,
}

impl Default for HandshakeTuning {
    fn default() -> Self {
        Self {
            cycle_delay: DEFAULT_HANDSHAKE_CYCLE_DELAY,
            max_duration: DEFAULT_HANDSHAKE_MAX_DURATION,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub hosts: Vec<Host>,
    /// `None` means the client never authenticates.
    pub credentials: Option<Credentials>,
    pub name: String,
    /// Scopes subscription ids on the wire (`SUB foo sid@client_id`).
    pub client_id: String,
    pub verbose: bool,
    pub auto_respond_to_ping: bool,
    pub randomize_hosts: bool,
    pub consumer: ConsumerTuning,
    pub handshake: HandshakeTuning,
    /// Upper bound on waiting for the consumer task during release.
    pub release_timeout: Duration,
    pub default_max_payload: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            hosts: vec![Host::new("127.0.0.1", DEFAULT_PORT)],
            credentials: None,
            name: DEFAULT_CLIENT_NAME.to_string(),
            client_id: uuid::Uuid::new_v4().simple().to_string(),
            verbose: false,
            auto_respond_to_ping: true,
            randomize_hosts: true,
            consumer: ConsumerTuning::default(),
            handshake: HandshakeTuning::default(),
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
            default_max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ConnectionConfigOverride {
    hosts: Option<Vec<String>>,
    user: Option<String>,
    pass: Option<String>,
    name: Option<String>,
    client_id: Option<String>,
    verbose: Option<bool>,
    auto_respond_to_ping: Option<bool>,
    randomize_hosts: Option<bool>,
    consumer_spin_wait_ms: Option<u64>,
    consumer_idle_wait_ms: Option<u64>,
    idle_heartbeat_threshold: Option<u32>,
    handshake_cycle_delay_ms: Option<u64>,
    handshake_max_duration_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    release_timeout_ms: Option<u64>,
    default_max_payload: Option<usize>,
}

impl ConnectionConfig {
    pub fn new(hosts: impl IntoIterator<Item = Host>) -> Self {
        Self {
            hosts: hosts.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("NATTER_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ConnectionConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config)?;
        }
        Ok(config)
    }

    fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("NATTER_HOSTS") {
            config.hosts = parse_hosts(value.split(',')).context("parse NATTER_HOSTS")?;
        }
        if let Ok(user) = std::env::var("NATTER_USER") {
            let pass = std::env::var("NATTER_PASS").unwrap_or_default();
            config.credentials = Some(Credentials::new(user, pass));
        }
        if let Some(value) = read_bool_env("NATTER_VERBOSE") {
            config.verbose = value;
        }
        if let Some(value) = read_bool_env("NATTER_AUTO_PONG") {
            config.auto_respond_to_ping = value;
        }
        if let Some(value) = read_bool_env("NATTER_RANDOMIZE_HOSTS") {
            config.randomize_hosts = value;
        }
        if let Ok(value) = std::env::var("NATTER_CLIENT_NAME")
            && !value.is_empty()
        {
            config.name = value;
        }
        Ok(config)
    }

    pub fn with_hosts(mut self, hosts: impl IntoIterator<Item = Host>) -> Self {
        self.hosts = hosts.into_iter().collect();
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(user, pass));
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_auto_respond_to_ping(mut self, enabled: bool) -> Self {
        self.auto_respond_to_ping = enabled;
        self
    }

    pub fn with_randomized_hosts(mut self, enabled: bool) -> Self {
        self.randomize_hosts = enabled;
        self
    }

    pub fn with_consumer_tuning(mut self, tuning: ConsumerTuning) -> Self {
        self.consumer = tuning;
        self
    }

    pub fn with_handshake_tuning(mut self, tuning: HandshakeTuning) -> Self {
        self.handshake = tuning;
        self
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }
}

impl ConnectionConfigOverride {
    fn apply(&self, config: &mut ConnectionConfig) -> Result<()> {
        if let Some(hosts) = &self.hosts {
            config.hosts =
                parse_hosts(hosts.iter().map(String::as_str)).context("parse hosts override")?;
        }
        if let Some(user) = &self.user {
            config.credentials = Some(Credentials::new(
                user.clone(),
                self.pass.clone().unwrap_or_default(),
            ));
        }
        if let Some(value) = &self.name
            && !value.is_empty()
        {
            config.name = value.clone();
        }
        if let Some(value) = &self.client_id
            && !value.is_empty()
        {
            config.client_id = value.clone();
        }
        if let Some(value) = self.verbose {
            config.verbose = value;
        }
        if let Some(value) = self.auto_respond_to_ping {
            config.auto_respond_to_ping = value;
        }
        if let Some(value) = self.randomize_hosts {
            config.randomize_hosts = value;
        }
        if let Some(value) = positive_millis(self.consumer_spin_wait_ms) {
            config.consumer.spin_wait = value;
        }
        if let Some(value) = positive_millis(self.consumer_idle_wait_ms) {
            config.consumer.idle_wait = value;
        }
        if let Some(value) = self.idle_heartbeat_threshold
            && value > 0
        {
            config.consumer.idle_heartbeat_threshold = value;
        }
        if let Some(value) = positive_millis(self.handshake_cycle_delay_ms) {
            config.handshake.cycle_delay = value;
        }
        if let Some(value) = positive_millis(self.handshake_max_duration_ms) {
            config.handshake.max_duration = value;
        }
        if let Some(value) = positive_millis(self.connect_timeout_ms) {
            config.handshake.connect_timeout = value;
        }
        if let Some(value) = positive_millis(self.release_timeout_ms) {
            config.release_timeout = value;
        }
        if let Some(value) = self.default_max_payload
            && value > 0
        {
            config.default_max_payload = value;
        }
        Ok(())
    }
}

fn parse_hosts<'a>(values: impl Iterator<Item = &'a str>) -> Result<Vec<Host>> {
    values
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.parse::<Host>())
        .collect()
}

fn positive_millis(value: Option<u64>) -> Option<Duration> {
    value.filter(|ms| *ms > 0).map(Duration::from_millis)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ENV_KEYS: [&str; 8] = [
        "NATTER_HOSTS",
        "NATTER_USER",
        "NATTER_PASS",
        "NATTER_VERBOSE",
        "NATTER_AUTO_PONG",
        "NATTER_RANDOMIZE_HOSTS",
        "NATTER_CLIENT_NAME",
        "NATTER_CLIENT_CONFIG",
    ];

    fn clear_env() {
        unsafe {
            for key in ENV_KEYS {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn host_parsing() {
        assert_eq!("localhost".parse::<Host>().expect("host"), Host::new("localhost", 4222));
        assert_eq!("10.0.0.1:4333".parse::<Host>().expect("host"), Host::new("10.0.0.1", 4333));
        assert_eq!("[::1]".parse::<Host>().expect("host"), Host::new("::1", 4222));
        assert_eq!(
            "[2001:db8::1]:4222".parse::<Host>().expect("host"),
            Host::new("2001:db8::1", 4222)
        );
        assert_eq!("2001:db8::1".parse::<Host>().expect("host"), Host::new("2001:db8::1", 4222));
        assert!("".parse::<Host>().is_err());
        assert!(":4222".parse::<Host>().is_err());
        assert!("host:notaport".parse::<Host>().is_err());
        assert!("[::1".parse::<Host>().is_err());
        assert!("[::1]4222".parse::<Host>().is_err());
    }

    #[test]
    fn host_display_round_trips_through_parse() {
        for host in [Host::new("example.com", 1), Host::new("fe80::1", 4222)] {
            assert_eq!(host.to_string().parse::<Host>().expect("host"), host);
        }
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let rendered = format!("{:?}", Credentials::new("alice", "s3cret"));
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hosts, vec![Host::new("127.0.0.1", DEFAULT_PORT)]);
        assert!(config.credentials.is_none());
        assert!(config.auto_respond_to_ping);
        assert!(config.randomize_hosts);
        assert!(!config.verbose);
        assert_eq!(config.client_id.len(), 32);
        assert_eq!(config.consumer.spin_wait, Duration::from_millis(500));
        assert_eq!(config.consumer.idle_wait, Duration::from_millis(100));
        assert_eq!(config.consumer.idle_heartbeat_threshold, 5);
        assert_eq!(config.handshake.cycle_delay, Duration::from_millis(200));
        assert_eq!(config.handshake.max_duration, Duration::from_secs(2));
        assert_eq!(config.default_max_payload, DEFAULT_MAX_PAYLOAD);
    }

    #[test]
    fn client_ids_are_unique_per_config() {
        assert_ne!(
            ConnectionConfig::default().client_id,
            ConnectionConfig::default().client_id
        );
    }

    #[test]
    #[serial_test::serial]
    fn config_from_env_variables() {
        clear_env();
        unsafe {
            std::env::set_var("NATTER_HOSTS", "a:1, [::1]:2,,b");
            std::env::set_var("NATTER_USER", "alice");
            std::env::set_var("NATTER_PASS", "pw");
            std::env::set_var("NATTER_VERBOSE", "true");
            std::env::set_var("NATTER_AUTO_PONG", "0");
            std::env::set_var("NATTER_RANDOMIZE_HOSTS", "no");
            std::env::set_var("NATTER_CLIENT_NAME", "svc");
        }

        let config = ConnectionConfig::from_env_or_yaml(None).expect("config");
        assert_eq!(
            config.hosts,
            vec![Host::new("a", 1), Host::new("::1", 2), Host::new("b", 4222)]
        );
        assert_eq!(config.credentials, Some(Credentials::new("alice", "pw")));
        assert!(config.verbose);
        assert!(!config.auto_respond_to_ping);
        assert!(!config.randomize_hosts);
        assert_eq!(config.name, "svc");

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn config_invalid_env_host_returns_error() {
        clear_env();
        unsafe {
            std::env::set_var("NATTER_HOSTS", "a:bad");
        }
        assert!(ConnectionConfig::from_env_or_yaml(None).is_err());
        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn config_from_yaml_file() {
        clear_env();
        let yaml = r#"
hosts: ["h1:4222", "[2001:db8::1]:5222"]
user: bob
pass: hunter2
name: orders
client_id: C1
verbose: true
auto_respond_to_ping: false
randomize_hosts: false
consumer_spin_wait_ms: 20
consumer_idle_wait_ms: 10
idle_heartbeat_threshold: 3
handshake_cycle_delay_ms: 50
handshake_max_duration_ms: 400
connect_timeout_ms: 250
release_timeout_ms: 300
default_max_payload: 4096
"#;
        let mut temp_file = NamedTempFile::new().expect("temp file");
        temp_file.write_all(yaml.as_bytes()).expect("write");
        let path = temp_file.path().to_str().expect("path");

        let config = ConnectionConfig::from_env_or_yaml(Some(path)).expect("config");
        assert_eq!(
            config.hosts,
            vec![Host::new("h1", 4222), Host::new("2001:db8::1", 5222)]
        );
        assert_eq!(config.credentials, Some(Credentials::new("bob", "hunter2")));
        assert_eq!(config.name, "orders");
        assert_eq!(config.client_id, "C1");
        assert!(config.verbose);
        assert!(!config.auto_respond_to_ping);
        assert!(!config.randomize_hosts);
        assert_eq!(config.consumer.spin_wait, Duration::from_millis(20));
        assert_eq!(config.consumer.idle_wait, Duration::from_millis(10));
        assert_eq!(config.consumer.idle_heartbeat_threshold, 3);
        assert_eq!(config.handshake.cycle_delay, Duration::from_millis(50));
        assert_eq!(config.handshake.max_duration, Duration::from_millis(400));
        assert_eq!(config.handshake.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.release_timeout, Duration::from_millis(300));
        assert_eq!(config.default_max_payload, 4096);
    }

    #[test]
    #[serial_test::serial]
    fn config_yaml_overrides_ignore_zero_values() {
        clear_env();
        let yaml = r#"
consumer_spin_wait_ms: 0
idle_heartbeat_threshold: 0
default_max_payload: 0
release_timeout_ms: 700
"#;
        let mut temp_file = NamedTempFile::new().expect("temp file");
        temp_file.write_all(yaml.as_bytes()).expect("write");
        let path = temp_file.path().to_str().expect("path");

        let config = ConnectionConfig::from_env_or_yaml(Some(path)).expect("config");
        assert_eq!(config.consumer.spin_wait, DEFAULT_SPIN_WAIT);
        assert_eq!(config.consumer.idle_heartbeat_threshold, DEFAULT_IDLE_HEARTBEAT_THRESHOLD);
        assert_eq!(config.default_max_payload, DEFAULT_MAX_PAYLOAD);
        assert_eq!(config.release_timeout, Duration::from_millis(700));
    }

    #[test]
    #[serial_test::serial]
    fn config_path_from_env_variable() {
        clear_env();
        let mut temp_file = NamedTempFile::new().expect("temp file");
        temp_file.write_all(b"name: from-file\n").expect("write");
        unsafe {
            std::env::set_var("NATTER_CLIENT_NAME", "from-env");
            std::env::set_var(
                "NATTER_CLIENT_CONFIG",
                temp_file.path().to_str().expect("path"),
            );
        }

        let config = ConnectionConfig::from_env_or_yaml(None).expect("config");
        assert_eq!(config.name, "from-file");
        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn config_invalid_yaml_file_returns_error() {
        clear_env();
        let mut temp_file = NamedTempFile::new().expect("temp file");
        temp_file.write_all(b"hosts: [invalid\n").expect("write");
        let path = temp_file.path().to_str().expect("path");
        assert!(ConnectionConfig::from_env_or_yaml(Some(path)).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn config_nonexistent_file_returns_error() {
        clear_env();
        let result = ConnectionConfig::from_env_or_yaml(Some("/nonexistent/path/natter.yaml"));
        assert!(result.is_err());
    }
}
