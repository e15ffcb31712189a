//! Configuration module for the seekerd daemon.
//!
//! Loads configuration from `config.toml` with environment variable overrides
//! and validates the assembled snapshot before it becomes observable. The
//! recognized tunables and their metadata live in [`registry`]; snapshot
//! comparison lives in [`diff`]; the live store with change fan-out lives in
//! [`store`].

pub mod diff;
pub mod registry;
pub mod store;

use config::{Config as ConfigLoader, Environment, File};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::AppError;

pub use diff::OptionChange;
pub use registry::{ChangeClass, OptionDescriptor, DESCRIPTORS};
pub use store::OptionsStore;

/// Main daemon configuration snapshot.
///
/// Snapshots are immutable once assembled; the [`OptionsStore`] swaps whole
/// snapshots and publishes field-level diffs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub instance: InstanceOptions,
    #[serde(default)]
    pub web: WebOptions,
    #[serde(default)]
    pub database: DatabaseOptions,
    #[serde(default)]
    pub soulseek: SoulseekOptions,
    #[serde(default)]
    pub shares: SharesOptions,
    #[serde(default)]
    pub transfers: TransfersOptions,
    #[serde(default)]
    pub directories: DirectoriesOptions,
    #[serde(default)]
    pub relay: RelayOptions,
}

/// Instance identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOptions {
    /// Host name this process contributes shares under.
    #[serde(default = "default_instance_name")]
    pub name: String,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            name: default_instance_name(),
        }
    }
}

fn default_instance_name() -> String {
    "local".to_string()
}

/// HTTP listener configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebOptions {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Static content root; changing it requires a restart.
    #[serde(default = "default_content_path")]
    pub content_path: PathBuf,
}

impl Default for WebOptions {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
            content_path: default_content_path(),
        }
    }
}

fn default_web_host() -> String {
    "0.0.0.0".to_string()
}

fn default_web_port() -> u16 {
    5030
}

fn default_content_path() -> PathBuf {
    PathBuf::from("./wwwroot")
}

/// Database configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseOptions {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/seekerd.db")
}

/// Soulseek network configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SoulseekOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Do not connect to the server even when credentials are configured.
    #[serde(default)]
    pub no_connect: bool,
    /// Free-form description served to user-info requests.
    #[serde(default = "default_description")]
    pub description: String,
    /// Usernames whose searches are never answered.
    #[serde(default)]
    pub search_blacklist: Vec<String>,
    #[serde(default)]
    pub distributed: DistributedOptions,
    #[serde(default)]
    pub connection: ConnectionOptions,
}

// Custom Debug implementation to avoid exposing password
impl std::fmt::Debug for SoulseekOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoulseekOptions")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .field("listen_port", &self.listen_port)
            .field("no_connect", &self.no_connect)
            .field("description", &self.description)
            .field("search_blacklist", &self.search_blacklist)
            .field("distributed", &self.distributed)
            .field("connection", &self.connection)
            .finish()
    }
}

impl Default for SoulseekOptions {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            server_host: default_server_host(),
            server_port: default_server_port(),
            listen_port: default_listen_port(),
            no_connect: false,
            description: default_description(),
            search_blacklist: Vec::new(),
            distributed: DistributedOptions::default(),
            connection: ConnectionOptions::default(),
        }
    }
}

fn default_server_host() -> String {
    "server.slsknet.org".to_string()
}

fn default_server_port() -> u16 {
    2242
}

fn default_listen_port() -> u16 {
    50300
}

fn default_description() -> String {
    "A seekerd share".to_string()
}

/// Distributed search overlay participation.
///
/// Passed through to the protocol client; the daemon does not implement the
/// overlay itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedOptions {
    #[serde(default = "default_distributed_enabled")]
    pub enabled: bool,
    #[serde(default = "default_child_limit")]
    pub child_limit: u32,
}

impl Default for DistributedOptions {
    fn default() -> Self {
        Self {
            enabled: default_distributed_enabled(),
            child_limit: default_child_limit(),
        }
    }
}

fn default_distributed_enabled() -> bool {
    true
}

fn default_child_limit() -> u32 {
    25
}

/// Server connection tuning. The protocol client cannot patch this block
/// partially; any change replaces the whole block and affects new
/// connections only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    #[serde(default = "default_connect_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_inactivity_ms")]
    pub inactivity_ms: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub proxy: ProxyOptions,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout_ms: default_connect_timeout_ms(),
            inactivity_ms: default_inactivity_ms(),
            buffer_size: default_buffer_size(),
            proxy: ProxyOptions::default(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_inactivity_ms() -> u64 {
    15_000
}

fn default_buffer_size() -> usize {
    16384
}

/// SOCKS-style proxy for the server connection.
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProxyOptions {
    #[serde(default)]
    pub enabled: bool,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("enabled", &self.enabled)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Shared directory configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharesOptions {
    /// Roots to scan. Each root is advertised under a stable mask.
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    /// Regex filter rules applied to masked paths. A leading `!` marks an
    /// include rule; everything else excludes.
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
    #[serde(default = "default_scan_on_start")]
    pub scan_on_start: bool,
}

impl Default for SharesOptions {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            filters: Vec::new(),
            on_conflict: ConflictPolicy::default(),
            scan_on_start: default_scan_on_start(),
        }
    }
}

fn default_scan_on_start() -> bool {
    true
}

/// Policy when two roots contribute the same masked path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Keep the later insertion and log a warning.
    #[default]
    Replace,
    /// Fail the fill.
    Error,
}

/// Transfer concurrency and pacing configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransfersOptions {
    #[serde(default)]
    pub uploads: UploadLimits,
    #[serde(default)]
    pub downloads: DownloadLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadLimits {
    #[serde(default = "default_upload_slots")]
    pub slots: u32,
    #[serde(default = "default_upload_slots_per_user")]
    pub slots_per_user: u32,
    /// Per-transfer ceiling in bytes per second; 0 means unlimited.
    #[serde(default)]
    pub speed_limit: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            slots: default_upload_slots(),
            slots_per_user: default_upload_slots_per_user(),
            speed_limit: 0,
        }
    }
}

fn default_upload_slots() -> u32 {
    10
}

fn default_upload_slots_per_user() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadLimits {
    #[serde(default = "default_download_slots")]
    pub slots: u32,
}

impl Default for DownloadLimits {
    fn default() -> Self {
        Self {
            slots: default_download_slots(),
        }
    }
}

fn default_download_slots() -> u32 {
    50
}

/// Download staging directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoriesOptions {
    #[serde(default = "default_incomplete_dir")]
    pub incomplete: PathBuf,
    #[serde(default = "default_downloads_dir")]
    pub downloads: PathBuf,
}

impl Default for DirectoriesOptions {
    fn default() -> Self {
        Self {
            incomplete: default_incomplete_dir(),
            downloads: default_downloads_dir(),
        }
    }
}

fn default_incomplete_dir() -> PathBuf {
    PathBuf::from("./data/incomplete")
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("./data/downloads")
}

/// Controller/Agent federation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayOptions {
    #[serde(default)]
    pub mode: RelayMode,
    /// Controller-side TCP port agents dial.
    #[serde(default = "default_relay_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub controller: ControllerOptions,
    #[serde(default)]
    pub agents: Vec<AgentOptions>,
    /// How long to wait for the first byte of an agent response.
    #[serde(default = "default_file_timeout_ms")]
    pub file_timeout_ms: u64,
    /// Transport-level cap on relayed file bodies, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            mode: RelayMode::default(),
            listen_port: default_relay_port(),
            controller: ControllerOptions::default(),
            agents: Vec::new(),
            file_timeout_ms: default_file_timeout_ms(),
            max_file_size: default_max_file_size(),
        }
    }
}

fn default_relay_port() -> u16 {
    50305
}

fn default_file_timeout_ms() -> u64 {
    3000
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 * 1024
}

/// Federation role of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Plain standalone daemon.
    #[default]
    None,
    /// Speaks to the Soulseek network; agents supply file bodies.
    Controller,
    /// Holds files and an index slice; serves them to a controller.
    Agent,
}

impl std::fmt::Display for RelayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayMode::None => write!(f, "none"),
            RelayMode::Controller => write!(f, "controller"),
            RelayMode::Agent => write!(f, "agent"),
        }
    }
}

/// Agent-side settings for reaching the controller.
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ControllerOptions {
    /// `host:port` of the controller's relay listener.
    pub address: Option<String>,
    /// Base URL of the controller's HTTP API.
    pub api_url: Option<String>,
    /// Pre-shared secret for this agent.
    pub secret: Option<String>,
    /// Name this agent authenticates as.
    pub agent_name: Option<String>,
}

impl std::fmt::Debug for ControllerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerOptions")
            .field("address", &self.address)
            .field("api_url", &self.api_url)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("agent_name", &self.agent_name)
            .finish()
    }
}

/// Controller-side registration of one agent.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOptions {
    pub name: String,
    pub secret: String,
}

impl std::fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOptions")
            .field("name", &self.name)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Validation
// =============================================================================

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    /// Dotted path of the offending option.
    pub path: String,
    pub message: String,
}

/// Composite, tree-shaped validation report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub failures: Vec<ValidationFailure>,
}

impl ValidationReport {
    pub fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.failures.push(ValidationFailure {
            path: path.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Group failures by top-level section so the report reads as a tree.
        let mut sections: Vec<(&str, Vec<&ValidationFailure>)> = Vec::new();
        for failure in &self.failures {
            let section = failure.path.split('.').next().unwrap_or("");
            match sections.iter_mut().find(|(name, _)| *name == section) {
                Some((_, entries)) => entries.push(failure),
                None => sections.push((section, vec![failure])),
            }
        }
        for (i, (section, entries)) in sections.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: [", section)?;
            for (j, failure) in entries.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", failure.path, failure.message)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

lazy_static! {
    static ref HOST_PORT: Regex = Regex::new(r"^[A-Za-z0-9_.-]+:\d{1,5}$").unwrap();
}

impl Options {
    /// Load configuration from `config.toml` and environment variables.
    pub fn load() -> Result<Self, AppError> {
        Self::load_from("config.toml")
    }

    /// Load configuration from a specific file path.
    ///
    /// Configuration is loaded in the following order (later sources override
    /// earlier):
    /// 1. Default values
    /// 2. The named TOML file (optional)
    /// 3. Environment variables with `SEEKERD_` prefix
    ///
    /// Environment variables use double underscore for nesting:
    /// - `SEEKERD_SOULSEEK__LISTEN_PORT=50301` sets `soulseek.listen_port`
    /// - `SEEKERD_WEB__PORT=5031` sets `web.port`
    pub fn load_from(config_path: &str) -> Result<Self, AppError> {
        let loader = ConfigLoader::builder()
            .add_source(File::with_name(config_path).required(false))
            .add_source(
                Environment::with_prefix("SEEKERD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let options: Options = loader.try_deserialize()?;

        match options.validate() {
            report if report.is_empty() => Ok(options),
            report => Err(AppError::ConfigurationInvalid(report)),
        }
    }

    /// Validate the snapshot. An empty report means the snapshot may be
    /// swapped in; a non-empty one aborts the swap.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.instance.name.is_empty() {
            report.push("instance.name", "must not be empty");
        }

        if self.soulseek.username.is_some() != self.soulseek.password.is_some() {
            report.push(
                "soulseek.username",
                "username and password must be configured together",
            );
        }
        if self.soulseek.listen_port == 0 {
            report.push("soulseek.listen_port", "must be non-zero");
        }
        if self.soulseek.connection.timeout_ms < 1000 {
            report.push("soulseek.connection.timeout_ms", "minimum is 1000");
        }
        if self.soulseek.connection.inactivity_ms < 1000 {
            report.push("soulseek.connection.inactivity_ms", "minimum is 1000");
        }
        if self.soulseek.connection.buffer_size == 0 {
            report.push("soulseek.connection.buffer_size", "must be non-zero");
        }
        if self.soulseek.connection.proxy.enabled {
            if self.soulseek.connection.proxy.address.is_none() {
                report.push(
                    "soulseek.connection.proxy.address",
                    "required when the proxy is enabled",
                );
            }
            if self.soulseek.connection.proxy.port.is_none() {
                report.push(
                    "soulseek.connection.proxy.port",
                    "required when the proxy is enabled",
                );
            }
        }

        for (i, filter) in self.shares.filters.iter().enumerate() {
            let pattern = filter.strip_prefix('!').unwrap_or(filter);
            if let Err(e) = Regex::new(pattern) {
                report.push(format!("shares.filters[{}]", i), format!("invalid regex: {}", e));
            }
        }

        if self.transfers.uploads.slots == 0 {
            report.push("transfers.uploads.slots", "minimum is 1");
        }
        if self.transfers.uploads.slots_per_user == 0 {
            report.push("transfers.uploads.slots_per_user", "minimum is 1");
        }
        if self.transfers.downloads.slots == 0 {
            report.push("transfers.downloads.slots", "minimum is 1");
        }

        match self.relay.mode {
            RelayMode::Agent => {
                match &self.relay.controller.address {
                    Some(addr) if HOST_PORT.is_match(addr) => {}
                    Some(_) => report.push(
                        "relay.controller.address",
                        "must be a host:port pair",
                    ),
                    None => report.push("relay.controller.address", "required in agent mode"),
                }
                if self.relay.controller.api_url.is_none() {
                    report.push("relay.controller.api_url", "required in agent mode");
                }
                if self.relay.controller.secret.is_none() {
                    report.push("relay.controller.secret", "required in agent mode");
                }
                if self.relay.controller.agent_name.is_none() {
                    report.push("relay.controller.agent_name", "required in agent mode");
                }
            }
            RelayMode::Controller => {
                for (i, agent) in self.relay.agents.iter().enumerate() {
                    if agent.name.is_empty() {
                        report.push(format!("relay.agents[{}].name", i), "must not be empty");
                    }
                    if agent.secret.len() < 16 {
                        report.push(
                            format!("relay.agents[{}].secret", i),
                            "minimum length is 16",
                        );
                    }
                }
            }
            RelayMode::None => {}
        }
        if self.relay.file_timeout_ms == 0 {
            report.push("relay.file_timeout_ms", "must be non-zero");
        }
        if self.relay.max_file_size == 0 {
            report.push("relay.max_file_size", "must be non-zero");
        }

        report
    }

    /// Socket address of the HTTP listener.
    pub fn web_addr(&self) -> std::net::SocketAddr {
        use std::net::{IpAddr, SocketAddr};
        let ip: IpAddr = self.web.host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid host '{}', using 0.0.0.0", self.web.host);
            std::net::Ipv4Addr::UNSPECIFIED.into()
        });
        SocketAddr::new(ip, self.web.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = Options::load_from("nonexistent.toml").unwrap();
        assert_eq!(options.web.port, 5030);
        assert_eq!(options.soulseek.server_host, "server.slsknet.org");
        assert_eq!(options.soulseek.listen_port, 50300);
        assert_eq!(options.transfers.uploads.slots, 10);
        assert_eq!(options.relay.mode, RelayMode::None);
        assert_eq!(options.relay.file_timeout_ms, 3000);
    }

    #[test]
    fn test_validate_defaults_clean() {
        let options = Options::default();
        assert!(options.validate().is_empty());
    }

    #[test]
    fn test_validate_timeout_minimum() {
        let mut options = Options::default();
        options.soulseek.connection.timeout_ms = 500;
        let report = options.validate();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "soulseek.connection.timeout_ms");
    }

    #[test]
    fn test_validate_credentials_pairing() {
        let mut options = Options::default();
        options.soulseek.username = Some("user".to_string());
        assert!(!options.validate().is_empty());

        options.soulseek.password = Some("pass".to_string());
        assert!(options.validate().is_empty());
    }

    #[test]
    fn test_validate_agent_mode_requirements() {
        let mut options = Options::default();
        options.relay.mode = RelayMode::Agent;
        let report = options.validate();
        let paths: Vec<&str> = report.failures.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"relay.controller.address"));
        assert!(paths.contains(&"relay.controller.secret"));
        assert!(paths.contains(&"relay.controller.agent_name"));
    }

    #[test]
    fn test_validate_bad_filter_regex() {
        let mut options = Options::default();
        options.shares.filters = vec!["[unclosed".to_string()];
        let report = options.validate();
        assert_eq!(report.failures[0].path, "shares.filters[0]");
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut options = Options::default();
        options.soulseek.username = Some("user".to_string());
        options.soulseek.password = Some("pass".to_string());
        options.shares.directories = vec![PathBuf::from("/m/a")];
        options.relay.mode = RelayMode::Controller;
        options.relay.agents = vec![AgentOptions {
            name: "a1".to_string(),
            secret: "0123456789abcdef".to_string(),
        }];

        let serialized = serde_json::to_string(&options).unwrap();
        let reparsed: Options = serde_json::from_str(&serialized).unwrap();
        assert_eq!(options, reparsed);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut options = Options::default();
        options.soulseek.password = Some("hunter2".to_string());
        let rendered = format!("{:?}", options.soulseek);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_validation_report_display_groups_by_section() {
        let mut report = ValidationReport::default();
        report.push("soulseek.listen_port", "must be non-zero");
        report.push("soulseek.connection.timeout_ms", "minimum is 1000");
        report.push("relay.file_timeout_ms", "must be non-zero");
        let rendered = report.to_string();
        assert!(rendered.starts_with("soulseek: ["));
        assert!(rendered.contains("relay: ["));
    }
}
