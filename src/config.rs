//! On-disk TOML configuration, overridable by CLI flags (§10). Deliberately excludes
//! the account password: that is only ever read interactively via `rpassword`.

use crate::error::{Result, WalletError};
use crate::types::NetType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
	pub account_path: String,
	pub daemon_url: String,
	pub daemon_port: u16,
	pub use_tor_for_daemon: bool,
	pub socks5_addr: String,
	pub network_type: NetType,
	pub bind_loopback_base_port: u16,
}

impl Default for AppConfig {
	fn default() -> Self {
		AppConfig {
			account_path: default_account_path().to_string_lossy().into_owned(),
			daemon_url: "127.0.0.1".to_string(),
			daemon_port: 18081,
			use_tor_for_daemon: false,
			socks5_addr: "127.0.0.1:9050".to_string(),
			network_type: NetType::Mainnet,
			bind_loopback_base_port: 18900,
		}
	}
}

fn default_account_path() -> PathBuf {
	dirs::data_dir()
		.unwrap_or_else(|| PathBuf::from("."))
		.join("oniongate")
		.join("account.dat")
}

pub fn default_config_path() -> PathBuf {
	dirs::config_dir()
		.unwrap_or_else(|| PathBuf::from("."))
		.join("oniongate")
		.join("config.toml")
}

impl AppConfig {
	pub fn load(path: &Path) -> Result<Self> {
		let text = fs::read_to_string(path).map_err(|e| WalletError::Persistence(format!("reading {path:?}: {e}")))?;
		toml::from_str(&text).map_err(|e| WalletError::Persistence(format!("parsing {path:?}: {e}")))
	}

	pub fn write(&self, path: &Path) -> Result<()> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		let text = toml::to_string_pretty(self).map_err(|e| WalletError::Persistence(format!("serializing config: {e}")))?;
		fs::write(path, text)?;
		Ok(())
	}

	/// CLI flags override individual fields; `None` leaves the config-file value alone.
	pub fn apply_overrides(
		&mut self,
		daemon_url: Option<&str>,
		daemon_port: Option<u16>,
		use_tor_for_daemon: Option<bool>,
		socks5_addr: Option<&str>,
		network_type: Option<NetType>,
	) {
		if let Some(v) = daemon_url {
			self.daemon_url = v.to_string();
		}
		if let Some(v) = daemon_port {
			self.daemon_port = v;
		}
		if let Some(v) = use_tor_for_daemon {
			self.use_tor_for_daemon = v;
		}
		if let Some(v) = socks5_addr {
			self.socks5_addr = v.to_string();
		}
		if let Some(v) = network_type {
			self.network_type = v;
		}
	}
}

/// Accepts a restore height as a raw block height, 10-digit epoch-seconds, 13-digit
/// epoch-milliseconds, or an ISO `YYYY-MM-DD` date, and resolves it to a best-effort
/// block height via the wall-clock anchor estimate.
pub fn parse_height_or_date(input: &str, net: NetType) -> Result<u64> {
	let trimmed = input.trim();

	if let Ok(height) = trimmed.parse::<u64>() {
		return match trimmed.len() {
			1..=9 => Ok(height),
			10 => Ok(crate::chain_height::estimate_from_timestamp(height as i64, net)),
			13 => Ok(crate::chain_height::estimate_from_timestamp(height as i64 / 1000, net)),
			_ => Err(WalletError::input_invalid(format!("unrecognized height/timestamp: {trimmed}"))),
		};
	}

	let date = chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
		.map_err(|e| WalletError::input_invalid(format!("not a height, timestamp, or ISO date ({trimmed}): {e}")))?;
	let midnight = date
		.and_hms_opt(0, 0, 0)
		.ok_or_else(|| WalletError::input_invalid("invalid time of day"))?;
	Ok(crate::chain_height::estimate_from_timestamp(midnight.and_utc().timestamp(), net))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn write_then_load_round_trips() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("config.toml");
		let config = AppConfig::default();
		config.write(&path).unwrap();
		let loaded = AppConfig::load(&path).unwrap();
		assert_eq!(loaded.daemon_port, config.daemon_port);
	}

	#[test]
	fn overrides_apply_only_when_present() {
		let mut config = AppConfig::default();
		let original_url = config.daemon_url.clone();
		config.apply_overrides(None, Some(18089), None, None, None);
		assert_eq!(config.daemon_url, original_url);
		assert_eq!(config.daemon_port, 18089);
	}

	#[test]
	fn parse_height_or_date_accepts_raw_height() {
		assert_eq!(parse_height_or_date("3000000", NetType::Mainnet).unwrap(), 3_000_000);
	}

	#[test]
	fn parse_height_or_date_accepts_iso_date() {
		let height = parse_height_or_date("2024-01-01", NetType::Mainnet).unwrap();
		assert!(height > 0);
	}

	#[test]
	fn parse_height_or_date_rejects_garbage() {
		assert!(parse_height_or_date("not-a-height", NetType::Mainnet).is_err());
	}
}
