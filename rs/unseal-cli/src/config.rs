use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use unseal::{Account, RunConfig};

/// Accounts file:
///
/// ```toml
/// [defaults]
/// chunks = 10
/// streaming = false
///
/// [[accounts]]
/// name = "us-1"
/// key_addr = "127.0.0.1:10020"
/// storefront = "us"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub defaults: Defaults,

	#[serde(default, deserialize_with = "accounts")]
	pub accounts: Vec<Account>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Defaults {
	pub chunks: Option<usize>,
	#[serde(default)]
	pub streaming: bool,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
	name: String,
	key_addr: String,
	#[serde(default)]
	storefront: String,
}

fn accounts<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Vec<Account>, D::Error> {
	let entries = Vec::<AccountEntry>::deserialize(deserializer)?;
	Ok(entries
		.into_iter()
		.map(|entry| Account {
			name: entry.name,
			key_addr: entry.key_addr,
			storefront: entry.storefront,
		})
		.collect())
}

impl Config {
	/// Load the config file (missing file means empty config) and append any
	/// `name,key_addr[,storefront]` specs from the command line.
	pub fn load(path: &Path, extra: &[String]) -> anyhow::Result<Self> {
		let mut config = match std::fs::read_to_string(path) {
			Ok(text) => toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Config::default(),
			Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
		};

		for spec in extra {
			config.accounts.push(parse_spec(spec)?);
		}

		Ok(config)
	}

	pub fn run_config(&self, chunks: Option<usize>, streaming: bool) -> RunConfig {
		let defaults = RunConfig::default();
		RunConfig {
			chunk_count: chunks.or(self.defaults.chunks).unwrap_or(defaults.chunk_count),
			streaming: streaming || self.defaults.streaming,
			..defaults
		}
	}
}

fn parse_spec(spec: &str) -> anyhow::Result<Account> {
	let mut parts = spec.splitn(3, ',');
	let name = parts.next().unwrap_or_default().trim();
	let key_addr = parts.next().unwrap_or_default().trim();
	let storefront = parts.next().unwrap_or_default().trim();

	if name.is_empty() || key_addr.is_empty() {
		anyhow::bail!("bad --account {spec:?}, expected name,key_addr[,storefront]");
	}

	Ok(Account {
		name: name.to_string(),
		key_addr: key_addr.to_string(),
		storefront: storefront.to_string(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn load_parses_accounts_and_defaults() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(
			file,
			"[defaults]\nchunks = 4\nstreaming = true\n\n\
			 [[accounts]]\nname = \"us-1\"\nkey_addr = \"127.0.0.1:10020\"\nstorefront = \"us\"\n"
		)
		.unwrap();

		let config = Config::load(file.path(), &[]).unwrap();
		assert_eq!(config.accounts.len(), 1);
		assert_eq!(config.accounts[0].storefront, "us");

		let run = config.run_config(None, false);
		assert_eq!(run.chunk_count, 4);
		assert!(run.streaming);

		// Command line wins over the file.
		let run = config.run_config(Some(12), false);
		assert_eq!(run.chunk_count, 12);
	}

	#[test]
	fn missing_file_is_empty_config() {
		let config = Config::load(Path::new("/nonexistent/accounts.toml"), &[]).unwrap();
		assert!(config.accounts.is_empty());
	}

	#[test]
	fn cli_specs_are_appended() {
		let config = Config::load(
			Path::new("/nonexistent/accounts.toml"),
			&["jp-1,127.0.0.1:10021,jp".to_string()],
		)
		.unwrap();
		assert_eq!(config.accounts.len(), 1);
		assert_eq!(config.accounts[0].name, "jp-1");
		assert_eq!(config.accounts[0].key_addr, "127.0.0.1:10021");
		assert_eq!(config.accounts[0].storefront, "jp");
	}
}
