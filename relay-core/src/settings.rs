use std::{
	fs,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use glob::Pattern;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
	adaptive::{Baseline, MAX_CONCURRENCY, MIN_CONCURRENCY},
	classify::MIB,
	retry::RetryPolicy,
};

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("cannot read {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("cannot parse {path}: {source}")]
	Parse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("invalid pattern {pattern:?}: {source}")]
	Pattern {
		pattern: String,
		#[source]
		source: glob::PatternError,
	},

	#[error("invalid configuration: {0}")]
	Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
	pub remote: RemoteSettings,
	pub transfer: TransferSettings,
	pub retry: RetrySettings,
	pub probe: ProbeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteSettings {
	pub host: String,
	pub user: Option<String>,
	pub port: u16,
	pub path: String,
	pub identity_file: Option<PathBuf>,
}

impl Default for RemoteSettings {
	fn default() -> Self {
		RemoteSettings { host: String::new(), user: None, port: 22, path: String::new(), identity_file: None }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferSettings {
	pub local_root: PathBuf,
	pub max_connections: usize,
	pub batch_size: usize,
	pub max_file_size: u64,
	pub timeout_secs: u64,
	pub compress: bool,
	pub include: Vec<String>,
	pub exclude: Vec<String>,
	pub inter_batch_delay_ms: u64,
	pub rsync_path: String,
	pub extra_args: Vec<String>,
}

impl Default for TransferSettings {
	fn default() -> Self {
		TransferSettings {
			local_root: PathBuf::from("."),
			max_connections: 5,
			batch_size: 50,
			max_file_size: 100 * MIB,
			timeout_secs: 30,
			compress: false,
			include: Vec::new(),
			exclude: vec![".git".into(), "node_modules".into(), "*.swp".into()],
			inter_batch_delay_ms: 100,
			rsync_path: "rsync".into(),
			extra_args: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
	pub timeout_base_ms: u64,
	pub network_base_ms: u64,
	pub other_delay_ms: u64,
}

impl Default for RetrySettings {
	fn default() -> Self {
		let policy = RetryPolicy::default();
		RetrySettings {
			timeout_base_ms: policy.timeout_base.as_millis() as u64,
			network_base_ms: policy.network_base.as_millis() as u64,
			other_delay_ms: policy.other_delay.as_millis() as u64,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeSettings {
	pub enabled: bool,
	pub interval_secs: u64,
	pub connect_timeout_secs: u64,
}

impl Default for ProbeSettings {
	fn default() -> Self {
		ProbeSettings { enabled: true, interval_secs: 60, connect_timeout_secs: 5 }
	}
}

/// ~/.config/relay/config.toml (platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|d| d.join("relay").join("config.toml"))
}

/// ~/.local/share/relay (platform equivalent), for logs.
pub fn data_dir() -> PathBuf {
	dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("relay")
}

impl Settings {
	/// Read and validate a config file.
	pub fn load(path: &Path) -> Result<Settings, SettingsError> {
		let text = fs::read_to_string(path).map_err(|source| SettingsError::Io { path: path.to_path_buf(), source })?;
		let settings: Settings =
			toml::from_str(&text).map_err(|source| SettingsError::Parse { path: path.to_path_buf(), source })?;
		settings.validate()?;
		Ok(settings)
	}

	/// An explicit path must exist; the default location may be absent.
	pub fn load_or_default(path: Option<&Path>) -> Result<Settings, SettingsError> {
		if let Some(path) = path {
			return Self::load(path);
		}
		match default_config_path() {
			Some(p) if p.exists() => Self::load(&p),
			_ => Ok(Settings::default()),
		}
	}

	pub fn validate(&self) -> Result<(), SettingsError> {
		if self.remote.host.trim().is_empty() {
			return Err(SettingsError::Invalid("remote.host is empty".into()));
		}
		if self.remote.path.trim().is_empty() {
			return Err(SettingsError::Invalid("remote.path is empty".into()));
		}
		let conns = self.transfer.max_connections;
		if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&conns) {
			return Err(SettingsError::Invalid(format!(
				"transfer.max_connections must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}, got {conns}"
			)));
		}
		if self.transfer.batch_size == 0 {
			return Err(SettingsError::Invalid("transfer.batch_size must be at least 1".into()));
		}
		if self.transfer.timeout_secs == 0 {
			return Err(SettingsError::Invalid("transfer.timeout_secs must be at least 1".into()));
		}
		self.filters()?;
		Ok(())
	}

	pub fn baseline(&self) -> Baseline {
		Baseline {
			max_concurrency: self.transfer.max_connections,
			batch_size: self.transfer.batch_size,
			timeout: Duration::from_secs(self.transfer.timeout_secs),
			compression: self.transfer.compress,
		}
	}

	pub fn retry_policy(&self) -> RetryPolicy {
		RetryPolicy {
			timeout_base: Duration::from_millis(self.retry.timeout_base_ms),
			network_base: Duration::from_millis(self.retry.network_base_ms),
			other_delay: Duration::from_millis(self.retry.other_delay_ms),
		}
	}

	pub fn inter_batch_delay(&self) -> Duration {
		Duration::from_millis(self.transfer.inter_batch_delay_ms)
	}

	pub fn filters(&self) -> Result<PathFilter, SettingsError> {
		PathFilter::new(&self.transfer.include, &self.transfer.exclude)
	}

	/// `[user@]host:<remote path>/<rel>`
	pub fn remote_spec(&self, rel: &Path) -> String {
		let base = self.remote.path.trim_end_matches('/');
		let joined = if rel.as_os_str().is_empty() {
			format!("{base}/")
		} else {
			format!("{base}/{}", rel.display())
		};
		match &self.remote.user {
			Some(user) => format!("{user}@{}:{joined}", self.remote.host),
			None => format!("{}:{joined}", self.remote.host),
		}
	}

	pub fn local_path(&self, rel: &Path) -> PathBuf {
		self.transfer.local_root.join(rel)
	}

	/// `[user@]host` for ssh.
	pub fn ssh_target(&self) -> String {
		match &self.remote.user {
			Some(user) => format!("{user}@{}", self.remote.host),
			None => self.remote.host.clone(),
		}
	}
}

/// Include/exclude globs applied to root-relative paths.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
	include: Vec<Pattern>,
	exclude: Vec<Pattern>,
}

impl PathFilter {
	pub fn new(include: &[String], exclude: &[String]) -> Result<Self, SettingsError> {
		let compile = |patterns: &[String]| {
			patterns
				.iter()
				.map(|p| Pattern::new(p).map_err(|source| SettingsError::Pattern { pattern: p.clone(), source }))
				.collect::<Result<Vec<_>, _>>()
		};
		Ok(PathFilter { include: compile(include)?, exclude: compile(exclude)? })
	}

	/// Exclusions match the path or any ancestor directory; inclusions match the path.
	pub fn allows(&self, rel: &Path) -> bool {
		let mut prefix = PathBuf::new();
		for component in rel.components() {
			prefix.push(component);
			if self.exclude.iter().any(|p| p.matches_path(&prefix)) {
				return false;
			}
		}
		self.include.is_empty() || self.include.iter().any(|p| p.matches_path(rel))
	}
}

/// Settings shared between the caller and the pool; read fresh at each scheduling decision.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings(Arc<RwLock<Settings>>);

impl SharedSettings {
	pub fn new(settings: Settings) -> Self {
		SharedSettings(Arc::new(RwLock::new(settings)))
	}

	pub fn snapshot(&self) -> Settings {
		self.0.read().clone()
	}

	pub fn replace(&self, settings: Settings) {
		*self.0.write() = settings;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn valid() -> Settings {
		let mut settings = Settings::default();
		settings.remote.host = "example.com".into();
		settings.remote.path = "/srv/app".into();
		settings
	}

	#[test]
	fn parses_partial_file_with_defaults() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("config.toml");
		fs::write(
			&path,
			r#"
[remote]
host = "example.com"
user = "deploy"
path = "/srv/app/"

[transfer]
max_connections = 3
exclude = ["target"]
"#,
		)
		.unwrap();

		let settings = Settings::load(&path).unwrap();
		assert_eq!(settings.remote.port, 22);
		assert_eq!(settings.transfer.max_connections, 3);
		assert_eq!(settings.transfer.batch_size, 50);
		assert_eq!(settings.transfer.exclude, vec!["target".to_string()]);
		assert_eq!(settings.remote_spec(Path::new("src/a.rs")), "deploy@example.com:/srv/app/src/a.rs");
		assert_eq!(settings.remote_spec(Path::new("")), "deploy@example.com:/srv/app/");
	}

	#[test]
	fn missing_explicit_file_is_an_error() {
		let err = Settings::load_or_default(Some(Path::new("/tmp/relay_definitely_not_real.toml"))).unwrap_err();
		assert!(matches!(err, SettingsError::Io { .. }));
	}

	#[test]
	fn rejects_bad_values() {
		let mut s = valid();
		s.transfer.max_connections = 11;
		assert!(matches!(s.validate(), Err(SettingsError::Invalid(_))));

		let mut s = valid();
		s.transfer.batch_size = 0;
		assert!(s.validate().is_err());

		let mut s = valid();
		s.remote.host.clear();
		assert!(s.validate().is_err());

		let mut s = valid();
		s.transfer.exclude = vec!["[".into()];
		assert!(matches!(s.validate(), Err(SettingsError::Pattern { .. })));
	}

	#[test]
	fn parse_error_names_the_file() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("bad.toml");
		fs::write(&path, "[transfer\nmax_connections = 3").unwrap();
		let err = Settings::load(&path).unwrap_err();
		assert!(err.to_string().contains("bad.toml"));
	}

	#[test]
	fn filter_excludes_ancestors_and_globs() {
		let filter = PathFilter::new(&[], &[".git".into(), "*.log".into()]).unwrap();
		assert!(!filter.allows(Path::new(".git/HEAD")));
		assert!(!filter.allows(Path::new("logs/app.log")));
		assert!(filter.allows(Path::new("src/main.rs")));
	}

	#[test]
	fn filter_include_restricts() {
		let filter = PathFilter::new(&["src/**".into()], &[]).unwrap();
		assert!(filter.allows(Path::new("src/a/b.rs")));
		assert!(!filter.allows(Path::new("docs/readme.md")));
	}

	#[test]
	fn shared_settings_see_replacements() {
		let shared = SharedSettings::new(valid());
		let mut next = valid();
		next.transfer.batch_size = 7;
		shared.replace(next);
		assert_eq!(shared.snapshot().transfer.batch_size, 7);
	}

	#[test]
	fn serializes_back_to_toml() {
		let text = toml::to_string_pretty(&valid()).unwrap();
		let back: Settings = toml::from_str(&text).unwrap();
		assert_eq!(back, valid());
	}
}
