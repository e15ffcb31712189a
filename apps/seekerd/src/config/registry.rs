//! Registry of recognized tunables.
//!
//! Every option the daemon understands is described here once: its CLI
//! names, environment variable, dotted key, default, and how a change to it
//! is classified. The diff machinery consults this table to attach change
//! classes and to redact secrets.

/// How a change to an option takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    /// Applied on the fly.
    None,
    /// Applied to the client, but the server connection must be re-established.
    RequiresReconnect,
    /// Only honored at process start.
    RequiresRestart,
}

/// Primitive type of an option leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Bool,
    Int,
    String,
    StringList,
    Path,
}

/// Static metadata for one tunable.
#[derive(Debug, Clone, Copy)]
pub struct OptionDescriptor {
    pub short_name: Option<&'static str>,
    pub long_name: &'static str,
    pub env_var: &'static str,
    /// Dotted path into the options tree.
    pub key: &'static str,
    pub kind: OptionKind,
    pub default: &'static str,
    pub description: &'static str,
    pub change_class: ChangeClass,
    pub secret: bool,
}

macro_rules! opt {
    ($short:expr, $long:expr, $env:expr, $key:expr, $kind:expr, $default:expr, $desc:expr, $class:expr, $secret:expr) => {
        OptionDescriptor {
            short_name: $short,
            long_name: $long,
            env_var: $env,
            key: $key,
            kind: $kind,
            default: $default,
            description: $desc,
            change_class: $class,
            secret: $secret,
        }
    };
}

use ChangeClass::{None as Live, RequiresReconnect, RequiresRestart};
use OptionKind::{Bool, Int, Path, String as Str, StringList};

/// All recognized options.
pub static DESCRIPTORS: &[OptionDescriptor] = &[
    opt!(None, "instance-name", "SEEKERD_INSTANCE__NAME", "instance.name", Str, "local", "Host name this instance contributes shares under", RequiresRestart, false),
    opt!(None, "web-host", "SEEKERD_WEB__HOST", "web.host", Str, "0.0.0.0", "HTTP bind address", RequiresRestart, false),
    opt!(Some("-p"), "web-port", "SEEKERD_WEB__PORT", "web.port", Int, "5030", "HTTP listen port", RequiresRestart, false),
    opt!(None, "content-path", "SEEKERD_WEB__CONTENT_PATH", "web.content_path", Path, "./wwwroot", "Static content root", RequiresRestart, false),
    opt!(None, "database", "SEEKERD_DATABASE__PATH", "database.path", Path, "./data/seekerd.db", "SQLite database file", RequiresRestart, false),
    opt!(Some("-u"), "username", "SEEKERD_SOULSEEK__USERNAME", "soulseek.username", Str, "", "Soulseek account username", RequiresReconnect, false),
    opt!(None, "password", "SEEKERD_SOULSEEK__PASSWORD", "soulseek.password", Str, "", "Soulseek account password", RequiresReconnect, true),
    opt!(None, "server-host", "SEEKERD_SOULSEEK__SERVER_HOST", "soulseek.server_host", Str, "server.slsknet.org", "Soulseek server host", RequiresReconnect, false),
    opt!(None, "server-port", "SEEKERD_SOULSEEK__SERVER_PORT", "soulseek.server_port", Int, "2242", "Soulseek server port", RequiresReconnect, false),
    opt!(Some("-l"), "listen-port", "SEEKERD_SOULSEEK__LISTEN_PORT", "soulseek.listen_port", Int, "50300", "Port for inbound peer connections", RequiresReconnect, false),
    opt!(Some("-n"), "no-connect", "SEEKERD_SOULSEEK__NO_CONNECT", "soulseek.no_connect", Bool, "false", "Do not connect to the Soulseek server", Live, false),
    opt!(None, "description", "SEEKERD_SOULSEEK__DESCRIPTION", "soulseek.description", Str, "A seekerd share", "User-info description", Live, false),
    opt!(None, "search-blacklist", "SEEKERD_SOULSEEK__SEARCH_BLACKLIST", "soulseek.search_blacklist", StringList, "", "Usernames whose searches are ignored", Live, false),
    opt!(None, "distributed", "SEEKERD_SOULSEEK__DISTRIBUTED__ENABLED", "soulseek.distributed.enabled", Bool, "true", "Participate in the distributed search overlay", Live, false),
    opt!(None, "child-limit", "SEEKERD_SOULSEEK__DISTRIBUTED__CHILD_LIMIT", "soulseek.distributed.child_limit", Int, "25", "Distributed-network child limit", Live, false),
    opt!(None, "connect-timeout", "SEEKERD_SOULSEEK__CONNECTION__TIMEOUT_MS", "soulseek.connection.timeout_ms", Int, "10000", "Connect timeout in milliseconds", RequiresReconnect, false),
    opt!(None, "inactivity-timeout", "SEEKERD_SOULSEEK__CONNECTION__INACTIVITY_MS", "soulseek.connection.inactivity_ms", Int, "15000", "Inactivity timeout in milliseconds", RequiresReconnect, false),
    opt!(None, "buffer-size", "SEEKERD_SOULSEEK__CONNECTION__BUFFER_SIZE", "soulseek.connection.buffer_size", Int, "16384", "Connection read/write buffer size", RequiresReconnect, false),
    opt!(None, "proxy", "SEEKERD_SOULSEEK__CONNECTION__PROXY__ENABLED", "soulseek.connection.proxy.enabled", Bool, "false", "Route the server connection through a proxy", RequiresReconnect, false),
    opt!(None, "proxy-address", "SEEKERD_SOULSEEK__CONNECTION__PROXY__ADDRESS", "soulseek.connection.proxy.address", Str, "", "Proxy address", RequiresReconnect, false),
    opt!(None, "proxy-port", "SEEKERD_SOULSEEK__CONNECTION__PROXY__PORT", "soulseek.connection.proxy.port", Int, "", "Proxy port", RequiresReconnect, false),
    opt!(None, "proxy-username", "SEEKERD_SOULSEEK__CONNECTION__PROXY__USERNAME", "soulseek.connection.proxy.username", Str, "", "Proxy username", RequiresReconnect, false),
    opt!(None, "proxy-password", "SEEKERD_SOULSEEK__CONNECTION__PROXY__PASSWORD", "soulseek.connection.proxy.password", Str, "", "Proxy password", RequiresReconnect, true),
    opt!(Some("-s"), "shared", "SEEKERD_SHARES__DIRECTORIES", "shares.directories", StringList, "", "Directories to share", Live, false),
    opt!(None, "share-filters", "SEEKERD_SHARES__FILTERS", "shares.filters", StringList, "", "Regex filter rules applied to masked paths", Live, false),
    opt!(None, "share-conflict", "SEEKERD_SHARES__ON_CONFLICT", "shares.on_conflict", Str, "replace", "Policy for duplicate masked paths", Live, false),
    opt!(None, "scan-on-start", "SEEKERD_SHARES__SCAN_ON_START", "shares.scan_on_start", Bool, "true", "Scan shares at boot", Live, false),
    opt!(None, "upload-slots", "SEEKERD_TRANSFERS__UPLOADS__SLOTS", "transfers.uploads.slots", Int, "10", "Global concurrent upload slots", Live, false),
    opt!(None, "upload-slots-per-user", "SEEKERD_TRANSFERS__UPLOADS__SLOTS_PER_USER", "transfers.uploads.slots_per_user", Int, "1", "Concurrent upload slots per user", Live, false),
    opt!(None, "upload-speed-limit", "SEEKERD_TRANSFERS__UPLOADS__SPEED_LIMIT", "transfers.uploads.speed_limit", Int, "0", "Per-upload speed ceiling in bytes/sec (0 = unlimited)", Live, false),
    opt!(None, "download-slots", "SEEKERD_TRANSFERS__DOWNLOADS__SLOTS", "transfers.downloads.slots", Int, "50", "Concurrent download requests", Live, false),
    opt!(None, "incomplete-dir", "SEEKERD_DIRECTORIES__INCOMPLETE", "directories.incomplete", Path, "./data/incomplete", "Staging directory for in-flight downloads", Live, false),
    opt!(None, "downloads-dir", "SEEKERD_DIRECTORIES__DOWNLOADS", "directories.downloads", Path, "./data/downloads", "Destination directory for completed downloads", Live, false),
    opt!(None, "relay-mode", "SEEKERD_RELAY__MODE", "relay.mode", Str, "none", "Federation role (none, controller, agent)", RequiresRestart, false),
    opt!(None, "relay-port", "SEEKERD_RELAY__LISTEN_PORT", "relay.listen_port", Int, "50305", "Controller-side relay listen port", RequiresRestart, false),
    opt!(None, "controller-address", "SEEKERD_RELAY__CONTROLLER__ADDRESS", "relay.controller.address", Str, "", "Controller relay address (host:port)", RequiresRestart, false),
    opt!(None, "controller-api-url", "SEEKERD_RELAY__CONTROLLER__API_URL", "relay.controller.api_url", Str, "", "Controller HTTP API base URL", RequiresRestart, false),
    opt!(None, "controller-secret", "SEEKERD_RELAY__CONTROLLER__SECRET", "relay.controller.secret", Str, "", "Pre-shared secret for the controller", RequiresRestart, true),
    opt!(None, "agent-name", "SEEKERD_RELAY__CONTROLLER__AGENT_NAME", "relay.controller.agent_name", Str, "", "Name this agent authenticates as", RequiresRestart, false),
    opt!(None, "relay-agents", "SEEKERD_RELAY__AGENTS", "relay.agents", StringList, "", "Registered agents (controller side)", Live, true),
    opt!(None, "relay-file-timeout", "SEEKERD_RELAY__FILE_TIMEOUT_MS", "relay.file_timeout_ms", Int, "3000", "First-byte timeout for agent responses", Live, false),
    opt!(None, "relay-max-file-size", "SEEKERD_RELAY__MAX_FILE_SIZE", "relay.max_file_size", Int, "10737418240", "Transport-level cap on relayed file bodies", Live, false),
];

/// Look up the descriptor whose key exactly matches, or whose key is the
/// longest prefix of `path` (covers indexed leaves such as
/// `relay.agents[0].secret`).
pub fn descriptor_for(path: &str) -> Option<&'static OptionDescriptor> {
    if let Some(descriptor) = DESCRIPTORS.iter().find(|d| d.key == path) {
        return Some(descriptor);
    }
    DESCRIPTORS
        .iter()
        .filter(|d| {
            path.starts_with(d.key)
                && matches!(
                    path.as_bytes().get(d.key.len()),
                    Some(b'.') | Some(b'[')
                )
        })
        .max_by_key(|d| d.key.len())
}
