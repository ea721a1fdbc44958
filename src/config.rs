//! The configuration value consumed by the core.
//!
//! There is no global state: a [`Config`] is built once at startup (optional
//! JSON5 file, then command-line overrides) and handed down by value.

use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::Deserialize;

use crate::{
	crypto::KeyMaterial,
	error::{Error, Result},
	format::Engine,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
	pub engine: Engine,

	#[serde(flatten)]
	pub connection: ConnectionConfig,

	/// Where archives land.
	pub backup_dir: PathBuf,

	/// gzip level 0–9; 0 means store (and, for pg custom dumps, is passed
	/// through to the tool's own `--compress`).
	pub compression_level: u32,

	/// Tool-internal parallelism (`pg_restore --jobs`).
	pub jobs: usize,
	/// Outer parallelism over databases in a cluster backup.
	pub dump_jobs: usize,
	/// Cap on outer × inner parallelism.
	pub max_cores: usize,

	pub sample_strategy: Option<SampleStrategy>,
	pub sample_value: Option<u64>,

	pub cluster_timeout_minutes: u64,

	pub encryption_key_file: Option<PathBuf>,
	pub encryption_key_env: Option<String>,

	pub retention_days: Option<u32>,
	pub min_backups: u32,

	#[serde(flatten)]
	pub cloud: CloudConfig,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			engine: Engine::Postgres,
			connection: ConnectionConfig::default(),
			backup_dir: PathBuf::from("."),
			compression_level: 6,
			jobs: 1,
			dump_jobs: 2,
			max_cores: num_cpus(),
			sample_strategy: None,
			sample_value: None,
			cluster_timeout_minutes: 240,
			encryption_key_file: None,
			encryption_key_env: None,
			retention_days: None,
			min_backups: 3,
			cloud: CloudConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
	pub host: String,
	pub port: Option<u16>,
	pub user: String,
	pub password: Option<String>,
	pub database: Option<String>,
	pub ssl_mode: SslMode,
	/// Disables TLS entirely, overriding `ssl_mode`.
	pub insecure: bool,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			host: "localhost".into(),
			port: None,
			user: "postgres".into(),
			password: None,
			database: None,
			ssl_mode: SslMode::Prefer,
			insecure: false,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
	Disable,
	Prefer,
	Require,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SampleStrategy {
	/// Every Nth row.
	Ratio,
	/// Statistical sample of roughly P percent of rows.
	Percent,
	/// First K rows.
	Count,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
	pub cloud_provider: Option<String>,
	pub cloud_bucket: Option<String>,
	pub cloud_region: Option<String>,
	pub cloud_endpoint: Option<String>,
	pub cloud_prefix: Option<String>,
	pub cloud_access_key: Option<String>,
	pub cloud_secret_key: Option<String>,
}

impl Config {
	/// Load from a JSON5 file, or defaults when no file is given.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		let Some(path) = path else {
			return Ok(Self::default());
		};

		let body = std::fs::read_to_string(path)
			.map_err(|e| Error::config(format!("reading {}: {e}", path.display())))?;
		let config: Self = json5::from_str(&body)
			.map_err(|e| Error::config(format!("parsing {}: {e}", path.display())))?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.compression_level > 9 {
			return Err(Error::config(format!(
				"compression_level must be 0–9, got {}",
				self.compression_level
			)));
		}
		if self.jobs < 1 || self.dump_jobs < 1 || self.max_cores < 1 {
			return Err(Error::config("jobs, dump_jobs and max_cores must be ≥ 1"));
		}
		if self.jobs * self.dump_jobs > self.max_cores {
			return Err(Error::config(format!(
				"jobs × dump_jobs ({} × {}) exceeds max_cores ({})",
				self.jobs, self.dump_jobs, self.max_cores
			)));
		}
		if self.cluster_timeout_minutes < 1 {
			return Err(Error::config("cluster_timeout_minutes must be ≥ 1"));
		}

		match (self.sample_strategy, self.sample_value) {
			(None, _) => {}
			(Some(_), None) => {
				return Err(Error::config("sample_strategy given without sample_value"))
			}
			(Some(SampleStrategy::Ratio), Some(n)) if n < 2 => {
				return Err(Error::config("sample ratio must be ≥ 2"))
			}
			(Some(SampleStrategy::Percent), Some(p)) if !(1..=100).contains(&p) => {
				return Err(Error::config("sample percent must be 1–100"))
			}
			(Some(SampleStrategy::Count), Some(k)) if k < 1 => {
				return Err(Error::config("sample count must be ≥ 1"))
			}
			(Some(_), Some(_)) => {}
		}

		Ok(())
	}

	pub fn port(&self) -> u16 {
		self.connection
			.port
			.unwrap_or_else(|| self.engine.default_port())
	}

	/// Whether TLS should be attempted at all.
	pub fn tls_enabled(&self) -> bool {
		!self.connection.insecure && self.connection.ssl_mode != SslMode::Disable
	}

	/// Resolve encryption key material, if any is configured.
	///
	/// A key file takes precedence over the environment variable.
	pub fn key_material(&self) -> Result<Option<KeyMaterial>> {
		if let Some(path) = &self.encryption_key_file {
			return KeyMaterial::from_file(path).map(Some);
		}
		if let Some(name) = &self.encryption_key_env {
			return KeyMaterial::from_env(name).map(Some);
		}
		Ok(None)
	}
}

fn num_cpus() -> usize {
	std::thread::available_parallelism()
		.map(|p| p.get())
		.unwrap_or(4)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_valid() {
		Config::default().validate().unwrap();
	}

	#[test]
	fn parallelism_budget_is_enforced() {
		let config = Config {
			jobs: 4,
			dump_jobs: 4,
			max_cores: 8,
			..Config::default()
		};
		match config.validate() {
			Err(Error::ConfigInvalid { .. }) => {}
			other => panic!("expected ConfigInvalid, got {other:?}"),
		}
	}

	#[test]
	fn sample_bounds() {
		let mut config = Config {
			sample_strategy: Some(SampleStrategy::Ratio),
			sample_value: Some(1),
			..Config::default()
		};
		assert!(config.validate().is_err());
		config.sample_value = Some(10);
		config.validate().unwrap();

		config.sample_strategy = Some(SampleStrategy::Percent);
		config.sample_value = Some(101);
		assert!(config.validate().is_err());
	}

	#[test]
	fn json5_file_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.json5");
		std::fs::write(
			&path,
			r#"{
				engine: "mysql",
				host: "db.internal",
				user: "backup",
				compression_level: 9,
				// comments are fine in json5
				min_backups: 7,
			}"#,
		)
		.unwrap();

		let config = Config::load(Some(&path)).unwrap();
		assert_eq!(config.engine, Engine::Mysql);
		assert_eq!(config.port(), 3306);
		assert_eq!(config.min_backups, 7);
		assert_eq!(config.compression_level, 9);
	}

	#[test]
	fn engine_port_derivation() {
		let config = Config::default();
		assert_eq!(config.port(), 5432);
		let config = Config {
			engine: Engine::Mariadb,
			..Config::default()
		};
		assert_eq!(config.port(), 3306);
	}
}
