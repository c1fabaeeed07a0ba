//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.sbdlink/config.json`) and environment.
//! Everything is fixed at startup; components receive the parsed `Config` through shared state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Webhook server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Local Signal identity and signal-cli invocation.
    #[serde(default)]
    pub signal: SignalConfig,

    /// RockBLOCK gateway credentials and device.
    #[serde(default)]
    pub rockblock: RockBlockConfig,

    /// Authorization list location and missing-file policy.
    #[serde(default)]
    pub whitelist: WhitelistConfig,

    /// Limits for background sends started by the webhook.
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Webhook bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the HTTP webhook (default 8999).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "0.0.0.0"; the satellite gateway calls in from outside).
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    8999
}

fn default_gateway_bind() -> String {
    "0.0.0.0".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// signal-cli settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalConfig {
    /// The bridge's own Signal number (`-u` for signal-cli). Overridden by SIGNAL_ACCOUNT env.
    #[serde(default)]
    pub account: Option<String>,

    /// signal-cli binary name or path (default "signal-cli").
    #[serde(default = "default_signal_binary")]
    pub binary: String,

    /// Upper bound for one `receive` call; hitting it means "no messages" (default 10).
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,

    /// Upper bound for one `send` call (default 60).
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Pause between receive calls (default 30).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_signal_binary() -> String {
    "signal-cli".to_string()
}

fn default_receive_timeout() -> u64 {
    10
}

fn default_send_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    30
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            account: None,
            binary: default_signal_binary(),
            receive_timeout_secs: default_receive_timeout(),
            send_timeout_secs: default_send_timeout(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// RockBLOCK MT (mobile-terminated) API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RockBlockConfig {
    /// MT endpoint (default https://rockblock.rock7.com/rockblock/MT).
    #[serde(default = "default_rockblock_url")]
    pub url: String,

    /// IMEI of the modem messages are sent to.
    #[serde(default)]
    pub imei: Option<String>,

    /// Account username. Overridden by ROCKBLOCK_USERNAME env.
    #[serde(default)]
    pub username: Option<String>,

    /// Account password. Overridden by ROCKBLOCK_PASSWORD env.
    #[serde(default)]
    pub password: Option<String>,

    /// Request timeout (default 10).
    #[serde(default = "default_rockblock_timeout")]
    pub timeout_secs: u64,
}

fn default_rockblock_url() -> String {
    "https://rockblock.rock7.com/rockblock/MT".to_string()
}

fn default_rockblock_timeout() -> u64 {
    10
}

impl Default for RockBlockConfig {
    fn default() -> Self {
        Self {
            url: default_rockblock_url(),
            imei: None,
            username: None,
            password: None,
            timeout_secs: default_rockblock_timeout(),
        }
    }
}

/// What `is_allowed` answers while the whitelist file does not exist yet.
///
/// `AllowAll` lets a fresh deployment work before anyone is whitelisted. It is a security
/// relevant default: until the file exists, every Signal sender can reach the modem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MissingWhitelistPolicy {
    /// Every identity is allowed (a warning is logged on each check).
    #[default]
    AllowAll,

    /// Nobody is allowed until the file exists.
    DenyAll,
}

/// Whitelist file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistConfig {
    /// One identity per line (default "signal.allowed"). Relative paths resolve against the config file's parent.
    #[serde(default = "default_whitelist_path")]
    pub path: PathBuf,

    /// "allowAll" (default) or "denyAll".
    #[serde(default)]
    pub missing_file: MissingWhitelistPolicy,
}

fn default_whitelist_path() -> PathBuf {
    PathBuf::from("signal.allowed")
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            path: default_whitelist_path(),
            missing_file: MissingWhitelistPolicy::default(),
        }
    }
}

/// Bounded background work for webhook-originated sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Jobs running at the same time (default 8).
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Jobs waiting to run; the webhook answers 503 when full (default 64).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long shutdown waits for queued jobs (default 30).
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_max_in_flight() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    64
}

fn default_drain_timeout() -> u64 {
    30
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            queue_capacity: default_queue_capacity(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

/// Env value if set and non-blank, else the trimmed config value if non-blank.
fn env_or(var: &str, configured: Option<&String>) -> Option<String> {
    std::env::var(var)
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            configured
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the local Signal account: env SIGNAL_ACCOUNT overrides config.
pub fn resolve_signal_account(config: &Config) -> Option<String> {
    env_or("SIGNAL_ACCOUNT", config.signal.account.as_ref())
}

/// Resolve the RockBLOCK username: env ROCKBLOCK_USERNAME overrides config.
pub fn resolve_rockblock_username(config: &Config) -> Option<String> {
    env_or("ROCKBLOCK_USERNAME", config.rockblock.username.as_ref())
}

/// Resolve the RockBLOCK password: env ROCKBLOCK_PASSWORD overrides config.
pub fn resolve_rockblock_password(config: &Config) -> Option<String> {
    env_or("ROCKBLOCK_PASSWORD", config.rockblock.password.as_ref())
}

/// Apply env overrides in place so components can read plain fields afterwards.
pub fn apply_env_overrides(config: &mut Config) {
    config.signal.account = resolve_signal_account(config);
    config.rockblock.username = resolve_rockblock_username(config);
    config.rockblock.password = resolve_rockblock_password(config);
}

/// Check the settings the bridge cannot run without.
pub fn validate(config: &Config) -> Result<()> {
    let account = config
        .signal
        .account
        .as_deref()
        .map(str::trim)
        .unwrap_or("");
    if account.is_empty() {
        anyhow::bail!("signal.account is not set (config or SIGNAL_ACCOUNT)");
    }
    if !crate::address::is_valid_identity(account) {
        anyhow::bail!("signal.account {:?} does not look like a phone number (+<digits>)", account);
    }
    if config.dispatch.max_in_flight == 0 || config.dispatch.queue_capacity == 0 {
        anyhow::bail!("dispatch.maxInFlight and dispatch.queueCapacity must be at least 1");
    }
    if u32::try_from(config.dispatch.max_in_flight).is_err() {
        anyhow::bail!("dispatch.maxInFlight must be at most {}", u32::MAX);
    }
    for (name, secs) in [
        ("signal.pollIntervalSecs", config.signal.poll_interval_secs),
        ("signal.receiveTimeoutSecs", config.signal.receive_timeout_secs),
        ("signal.sendTimeoutSecs", config.signal.send_timeout_secs),
        ("rockblock.timeoutSecs", config.rockblock.timeout_secs),
    ] {
        if secs == 0 {
            anyhow::bail!("{} must be at least 1", name);
        }
    }
    if config.rockblock.imei.as_deref().map(str::trim).unwrap_or("").is_empty() {
        log::warn!("rockblock.imei is not set; Signal messages cannot be forwarded to the modem");
    }
    if config.rockblock.username.is_none() || config.rockblock.password.is_none() {
        log::warn!("rockblock credentials are not set; uplink requests will be rejected");
    }
    Ok(())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("SBDLINK_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".sbdlink").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Whitelist path: absolute as-is, relative against the config file's parent.
pub fn resolve_whitelist_path(config: &Config, config_path: &Path) -> PathBuf {
    let p = &config.whitelist.path;
    if p.is_absolute() {
        return p.clone();
    }
    config_path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join(p)
}

/// Load config from the default path (or SBDLINK_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the whitelist file).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    apply_env_overrides(&mut config);
    Ok((config, path))
}
