#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tether_api::{DEFAULT_BASE_URL, DEFAULT_NOT_FOUND_COOLDOWN, DEFAULT_PIPELINE_URL, DEFAULT_USER_AGENT, SecretString};
use tracing::{info, warn};
use url::Url;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_PRESENCE_DEBOUNCE: Duration = Duration::from_secs(170);
pub const DEFAULT_WRIST_CAP: usize = 25;

/// Config directory: `<platform config dir>/tether`.
pub fn config_dir() -> anyhow::Result<PathBuf> {
	let base = dirs::config_dir().ok_or_else(|| anyhow!("could not determine config directory"))?;
	Ok(base.join("tether"))
}

/// Default config path: `<config dir>/tether/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	Ok(config_dir()?.join("config.toml"))
}

/// Load the client config from TOML and `TETHER_*` env overrides.
pub fn load_client_config_from_path(path: &Path) -> anyhow::Result<ClientConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ClientConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	if cfg.bindings_path.is_none() {
		cfg.bindings_path = path.parent().map(|dir| dir.join("favorite_slots.toml"));
	}
	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub api_base_url: Url,
	pub pipeline_url: Url,
	pub user_agent: String,
	/// Stored `auth` session cookie, reapplied on auto-login.
	pub auth_cookie: Option<SecretString>,
	/// Whether a "Missing Credentials" reply may trigger one auto-login per session.
	pub auto_login: bool,
	pub refresh_interval: Duration,
	pub presence_debounce: Duration,
	pub not_found_cooldown: Duration,
	pub wrist_cap: usize,
	/// Where the favorite slot bindings are persisted.
	pub bindings_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	auth_cookie: Option<String>,

	#[serde(default)]
	api: FileApiSettings,

	#[serde(default)]
	sync: FileSyncSettings,

	#[serde(default)]
	feed: FileFeedSettings,

	metrics_bind: Option<String>,
	bindings_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileApiSettings {
	base_url: Option<String>,
	pipeline_url: Option<String>,
	user_agent: Option<String>,
	auto_login: Option<bool>,
	not_found_cooldown_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSyncSettings {
	refresh_interval_secs: Option<u64>,
	presence_debounce_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileFeedSettings {
	wrist_cap: Option<usize>,
}

impl ClientConfig {
	/// Built-in defaults, as if loaded from an empty file.
	pub fn defaults() -> anyhow::Result<Self> {
		Self::from_file(FileConfig::default())
	}

	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let api_base_url = parse_url(file.api.base_url.as_deref(), DEFAULT_BASE_URL).context("api.base_url")?;
		let pipeline_url =
			parse_url(file.api.pipeline_url.as_deref(), DEFAULT_PIPELINE_URL).context("api.pipeline_url")?;

		Ok(Self {
			api_base_url,
			pipeline_url,
			user_agent: file
				.api
				.user_agent
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
			auth_cookie: file.auth_cookie.filter(|s| !s.trim().is_empty()).map(SecretString::new),
			auto_login: file.api.auto_login.unwrap_or(true),
			refresh_interval: file
				.sync
				.refresh_interval_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(DEFAULT_REFRESH_INTERVAL),
			presence_debounce: file
				.sync
				.presence_debounce_secs
				.map(Duration::from_secs)
				.unwrap_or(DEFAULT_PRESENCE_DEBOUNCE),
			not_found_cooldown: file
				.api
				.not_found_cooldown_secs
				.map(Duration::from_secs)
				.unwrap_or(DEFAULT_NOT_FOUND_COOLDOWN),
			wrist_cap: file.feed.wrist_cap.unwrap_or(DEFAULT_WRIST_CAP),
			bindings_path: file.bindings_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
			metrics_bind: file.metrics_bind.filter(|s| !s.trim().is_empty()),
		})
	}
}

/// API base URLs must end in `/` so endpoints join under them.
fn parse_url(value: Option<&str>, default: &str) -> anyhow::Result<Url> {
	let raw = value.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(default);
	let raw = if raw.ends_with('/') {
		raw.to_string()
	} else {
		format!("{raw}/")
	};
	Url::parse(&raw).with_context(|| format!("invalid url {raw:?}"))
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ClientConfig, var: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("TETHER_AUTH_COOKIE") {
		cfg.auth_cookie = Some(SecretString::new(v));
		info!("client config: auth_cookie overridden by env");
	}

	if let Some(v) = non_empty("TETHER_API_BASE_URL") {
		match parse_url(Some(&v), DEFAULT_BASE_URL) {
			Ok(url) => {
				cfg.api_base_url = url;
				info!("client config: api_base_url overridden by env");
			}
			Err(e) => warn!(error = %format!("{e:#}"), "client config: ignoring TETHER_API_BASE_URL"),
		}
	}

	if let Some(v) = non_empty("TETHER_PIPELINE_URL") {
		match parse_url(Some(&v), DEFAULT_PIPELINE_URL) {
			Ok(url) => {
				cfg.pipeline_url = url;
				info!("client config: pipeline_url overridden by env");
			}
			Err(e) => warn!(error = %format!("{e:#}"), "client config: ignoring TETHER_PIPELINE_URL"),
		}
	}

	if let Some(v) = non_empty("TETHER_AUTO_LOGIN")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.auto_login = enabled;
		info!(enabled, "client config: auto_login overridden by env");
	}

	if let Some(v) = non_empty("TETHER_REFRESH_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.refresh_interval = Duration::from_secs(secs);
		info!(secs, "client config: refresh_interval overridden by env");
	}

	if let Some(v) = non_empty("TETHER_PRESENCE_DEBOUNCE_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.presence_debounce = Duration::from_secs(secs);
		info!(secs, "client config: presence_debounce overridden by env");
	}

	if let Some(v) = non_empty("TETHER_METRICS_BIND") {
		cfg.metrics_bind = Some(v);
		info!("client config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("TETHER_BINDINGS_PATH") {
		cfg.bindings_path = Some(PathBuf::from(v));
		info!("client config: bindings_path overridden by env");
	}

	if cfg.auto_login && cfg.auth_cookie.is_none() {
		warn!("client config: auto_login enabled but no auth_cookie stored");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml: &str) -> ClientConfig {
		let file: FileConfig = toml::from_str(toml).expect("toml");
		ClientConfig::from_file(file).expect("config")
	}

	#[test]
	fn defaults_apply_to_empty_file() {
		let cfg = parse("");
		assert_eq!(cfg.api_base_url.as_str(), DEFAULT_BASE_URL);
		assert_eq!(cfg.pipeline_url.as_str(), DEFAULT_PIPELINE_URL);
		assert_eq!(cfg.presence_debounce, Duration::from_secs(170));
		assert_eq!(cfg.refresh_interval, DEFAULT_REFRESH_INTERVAL);
		assert_eq!(cfg.wrist_cap, 25);
		assert!(cfg.auto_login);
		assert!(cfg.auth_cookie.is_none());
	}

	#[test]
	fn file_values_override_defaults() {
		let cfg = parse(
			r#"
auth_cookie = "authcookie_1"
metrics_bind = "127.0.0.1:9100"

[api]
base_url = "http://localhost:8080/api/1"
auto_login = false

[sync]
refresh_interval_secs = 60
presence_debounce_secs = 10

[feed]
wrist_cap = 40
"#,
		);
		assert_eq!(cfg.api_base_url.as_str(), "http://localhost:8080/api/1/");
		assert_eq!(cfg.auth_cookie.as_ref().map(SecretString::expose), Some("authcookie_1"));
		assert!(!cfg.auto_login);
		assert_eq!(cfg.refresh_interval, Duration::from_secs(60));
		assert_eq!(cfg.presence_debounce, Duration::from_secs(10));
		assert_eq!(cfg.wrist_cap, 40);
		assert_eq!(cfg.metrics_bind.as_deref(), Some("127.0.0.1:9100"));
	}

	#[test]
	fn invalid_url_is_an_error() {
		let file: FileConfig = toml::from_str("[api]\nbase_url = \"not a url\"").expect("toml");
		assert!(ClientConfig::from_file(file).is_err());
	}

	#[test]
	fn env_overrides_win_and_bad_values_are_ignored() {
		let env: HashMap<&str, &str> = HashMap::from([
			("TETHER_AUTH_COOKIE", " authcookie_env "),
			("TETHER_AUTO_LOGIN", "off"),
			("TETHER_REFRESH_INTERVAL_SECS", "0"),
			("TETHER_PRESENCE_DEBOUNCE_SECS", "30"),
			("TETHER_API_BASE_URL", "::"),
		]);
		let mut cfg = ClientConfig::defaults().expect("defaults");
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.auth_cookie.as_ref().map(SecretString::expose), Some("authcookie_env"));
		assert!(!cfg.auto_login);
		assert_eq!(cfg.refresh_interval, DEFAULT_REFRESH_INTERVAL);
		assert_eq!(cfg.presence_debounce, Duration::from_secs(30));
		assert_eq!(cfg.api_base_url.as_str(), DEFAULT_BASE_URL);
	}

	#[test]
	fn bindings_default_next_to_config_file() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("config.toml");
		let cfg = load_client_config_from_path(&path).expect("load");
		assert_eq!(cfg.bindings_path, Some(dir.path().join("favorite_slots.toml")));
	}
}
