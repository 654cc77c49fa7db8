#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;
use wikichat_domain::SecretString;

use crate::error::ClientError;

pub const DEFAULT_BASE_DOMAIN: &str = "wikia.com";
pub const DEFAULT_AUTH_URL: &str = "https://services.wikia.com/auth/token";
pub const DEFAULT_COMMUNITY_DOMAIN: &str = "community";
pub const DEFAULT_USER_AGENT: &str = concat!("wikichat/", env!("CARGO_PKG_VERSION"));

/// Default config path: `~/.wikichat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".wikichat").join("config.toml"))
}

/// Load the client config from the default path and env overrides.
pub fn load_client_config() -> Result<ClientConfig, ClientError> {
	let path = default_config_path()?;
	load_client_config_from_path(&path)
}

/// Same as `load_client_config` but with an explicit config path.
pub fn load_client_config_from_path(path: &Path) -> Result<ClientConfig, ClientError> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))
		.map_err(|e| ClientError::Config(format!("{e:#}")))?
		.unwrap_or_default();

	let mut cfg = ClientConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.validate()?;
	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub username: String,
	pub password: SecretString,
	/// Domains joined once the client is logged in.
	pub auto_join: Vec<String>,
	pub site: SiteSettings,
}

/// Where the site and auth endpoints live.
#[derive(Debug, Clone)]
pub struct SiteSettings {
	pub base_domain: String,
	pub auth_url: String,
	/// Wiki hosting the block-list endpoints.
	pub community_domain: String,
	pub user_agent: String,
}

impl Default for SiteSettings {
	fn default() -> Self {
		Self {
			base_domain: DEFAULT_BASE_DOMAIN.to_string(),
			auth_url: DEFAULT_AUTH_URL.to_string(),
			community_domain: DEFAULT_COMMUNITY_DOMAIN.to_string(),
			user_agent: DEFAULT_USER_AGENT.to_string(),
		}
	}
}

impl SiteSettings {
	/// `http://<domain>.<base>/<script>.php`
	pub fn wiki_script(&self, domain: &str, script: &str) -> String {
		format!("http://{domain}.{}/{script}.php", self.base_domain)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	username: Option<String>,
	password: Option<String>,
	#[serde(default)]
	auto_join: Vec<String>,
	#[serde(default)]
	site: FileSiteSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSiteSettings {
	base_domain: Option<String>,
	auth_url: Option<String>,
	community_domain: Option<String>,
	user_agent: Option<String>,
}

impl ClientConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = SiteSettings::default();
		Self {
			username: file.username.map(|s| s.trim().to_string()).unwrap_or_default(),
			password: SecretString::new(file.password.unwrap_or_default()),
			auto_join: normalize_domains(file.auto_join),
			site: SiteSettings {
				base_domain: file
					.site
					.base_domain
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.base_domain),
				auth_url: file.site.auth_url.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.auth_url),
				community_domain: file
					.site
					.community_domain
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.community_domain),
				user_agent: file
					.site
					.user_agent
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.user_agent),
			},
		}
	}

	/// Credentials are mandatory.
	pub fn validate(&self) -> Result<(), ClientError> {
		if self.username.trim().is_empty() {
			return Err(ClientError::Config("no username provided".to_string()));
		}
		if self.password.is_blank() {
			return Err(ClientError::Config("no password provided".to_string()));
		}
		Ok(())
	}
}

fn normalize_domains(domains: impl IntoIterator<Item = String>) -> Vec<String> {
	domains
		.into_iter()
		.map(|d| d.trim().to_string())
		.filter(|d| !d.is_empty())
		.collect()
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
	if let Some(v) = var("WIKICHAT_USERNAME") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.username = v;
			info!("client config: username overridden by env");
		}
	}

	if let Some(v) = var("WIKICHAT_PASSWORD")
		&& !v.trim().is_empty()
	{
		cfg.password = SecretString::new(v);
		info!("client config: password overridden by env");
	}

	if let Some(v) = var("WIKICHAT_AUTO_JOIN") {
		cfg.auto_join = normalize_domains(v.split(',').map(str::to_string));
		info!(rooms = cfg.auto_join.len(), "client config: auto_join overridden by env");
	}

	if let Some(v) = var("WIKICHAT_BASE_DOMAIN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.site.base_domain = v;
			info!("site config: base_domain overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(s: &str) -> ClientConfig {
		ClientConfig::from_file(toml::from_str(s).expect("toml"))
	}

	#[test]
	fn file_values_and_defaults() {
		let cfg = parse(
			r#"
username = " Bot "
password = "pw"
auto_join = ["dev", "  ", "community"]

[site]
base_domain = "fandom.com"
"#,
		);
		assert_eq!(cfg.username, "Bot");
		assert_eq!(cfg.password.expose(), "pw");
		assert_eq!(cfg.auto_join, vec!["dev", "community"]);
		assert_eq!(cfg.site.base_domain, "fandom.com");
		assert_eq!(cfg.site.auth_url, DEFAULT_AUTH_URL);
		assert_eq!(cfg.site.wiki_script("dev", "api"), "http://dev.fandom.com/api.php");
		cfg.validate().expect("valid");
	}

	#[test]
	fn missing_credentials_are_fatal() {
		let err = parse("username = \"Bot\"").validate().unwrap_err();
		match err {
			ClientError::Config(msg) => assert!(msg.contains("password")),
			other => panic!("unexpected error: {other:?}"),
		}
		assert!(parse("password = \"pw\"").validate().is_err());
	}

	#[test]
	fn env_overrides_file() {
		let mut cfg = parse("username = \"Bot\"\npassword = \"pw\"");
		let env: HashMap<&str, &str> = HashMap::from([
			("WIKICHAT_USERNAME", "Other"),
			("WIKICHAT_AUTO_JOIN", "a, b,,c"),
			("WIKICHAT_PASSWORD", "   "),
		]);
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.username, "Other");
		assert_eq!(cfg.auto_join, vec!["a", "b", "c"]);
		// Blank env values do not clear the file password.
		assert_eq!(cfg.password.expose(), "pw");
	}

	#[test]
	fn missing_file_uses_defaults() {
		let path = std::env::temp_dir().join("wikichat-config-does-not-exist.toml");
		let file = read_toml_if_exists(&path).expect("read");
		assert!(file.is_none());
	}
}
