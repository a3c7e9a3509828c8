//! End-to-end pipeline: playlist → download → decrypt → rewritten output.
//!
//! The orchestrator owns the attempt loop over accounts, the scratch and
//! provisional-output lifecycle, and progress reporting. Each attempt runs
//! the full pipeline; a failed attempt leaves the scratch file behind so the
//! next one resumes instead of re-downloading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::BytesMut;
use reqwest::Client;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use url::Url;

use crate::boxes::BoxReader;
use crate::keys::KeySession;
use crate::metrics::Metrics;
use crate::playlist::Segment;
use crate::progress::{Meter, ProgressSender, Stage};
use crate::source::{ByteSource, FileSource, RangeSource, STREAM_CHUNK};
use crate::{Error, Result, decrypt, download, init, playlist, rewrite};

/// Immutable knobs threaded through one run. No global state anywhere.
#[derive(Debug, Clone)]
pub struct RunConfig {
	/// Parallel chunks in the pre-download path.
	pub chunk_count: usize,
	/// Per-request timeout for playlist, HEAD, and chunk downloads.
	pub download_timeout: Duration,
	/// Per-request timeout for the streaming path's sequential ranges.
	pub stream_timeout: Duration,
	/// Stream ranges straight into the decrypt loop instead of staging the
	/// whole file on disk.
	pub streaming: bool,
	/// Range size for the streaming path.
	pub stream_chunk: u64,
}

impl Default for RunConfig {
	fn default() -> Self {
		Self {
			chunk_count: 10,
			download_timeout: Duration::from_secs(30),
			stream_timeout: Duration::from_secs(60),
			streaming: false,
			stream_chunk: STREAM_CHUNK,
		}
	}
}

/// One back-end the pipeline can run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
	pub name: String,
	/// Key-service endpoint, `host:port`.
	pub key_addr: String,
	/// Preferred storefront; accounts matching the asset's storefront are
	/// tried first.
	pub storefront: String,
}

/// Fetch, decrypt, and finalize one asset.
///
/// Accounts whose storefront matches are tried first, then the rest in
/// configured order. The first success wins; after all accounts fail, the
/// last error is returned together with the attempt count.
#[allow(clippy::too_many_arguments)]
pub async fn run(
	asset_id: &str,
	playlist_url: &Url,
	output: &Path,
	accounts: &[Account],
	storefront: &str,
	cfg: &RunConfig,
	metrics: &Metrics,
	progress: Option<ProgressSender>,
) -> Result<()> {
	if accounts.is_empty() {
		return Err(Error::NoAccounts);
	}

	let client = Client::builder()
		.user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
		.build()?;

	let raw = client
		.get(playlist_url.clone())
		.timeout(cfg.download_timeout)
		.send()
		.await?
		.error_for_status()?
		.bytes()
		.await?;
	let segments = playlist::decode(&raw)?;
	let media_url = playlist_url.join(&segments[0].uri)?;

	debug!(segments = segments.len(), %media_url, "playlist decoded");

	let ordered = order_accounts(accounts, storefront);
	let mut last = None;
	let mut attempts = 0usize;

	for account in ordered {
		attempts += 1;
		metrics.record_attempt();
		info!(account = %account.name, storefront = %account.storefront, "attempting");

		match attempt(
			asset_id,
			&client,
			&media_url,
			&segments,
			output,
			account,
			cfg,
			metrics,
			progress.clone(),
		)
		.await
		{
			Ok(()) => {
				info!(account = %account.name, output = %output.display(), "done");
				return Ok(());
			}
			Err(err) => {
				warn!(account = %account.name, %err, category = ?err.category(), "attempt failed");
				last = Some(err);
			}
		}
	}

	Err(Error::Exhausted {
		attempts,
		last: Box::new(last.expect("at least one attempt ran")),
	})
}

/// Matching storefronts first, configured order preserved within each group.
fn order_accounts<'a>(accounts: &'a [Account], storefront: &str) -> Vec<&'a Account> {
	if storefront.is_empty() {
		return accounts.iter().collect();
	}

	let (preferred, fallback): (Vec<_>, Vec<_>) = accounts
		.iter()
		.partition(|account| account.storefront.eq_ignore_ascii_case(storefront));

	preferred.into_iter().chain(fallback).collect()
}

/// One full pipeline run against one account.
#[allow(clippy::too_many_arguments)]
async fn attempt(
	asset_id: &str,
	client: &Client,
	media_url: &Url,
	segments: &[Segment],
	output: &Path,
	account: &Account,
	cfg: &RunConfig,
	metrics: &Metrics,
	progress: Option<ProgressSender>,
) -> Result<()> {
	// Planning: size the media file.
	let total = download::head_size(client, media_url, cfg.download_timeout).await?;
	debug!(total, streaming = cfg.streaming, "planning complete");

	let scratch = suffixed(output, ".tmp_download");
	let part = suffixed(output, ".part");

	let result = if cfg.streaming {
		let source = RangeSource::new(
			client.clone(),
			media_url.clone(),
			total,
			cfg.stream_chunk,
			cfg.stream_timeout,
			metrics.clone(),
		);
		decrypt_stream(source, total, segments, asset_id, account, output, &part, metrics, progress).await
	} else {
		download::download(client, media_url, &scratch, total, cfg, metrics, progress.clone()).await?;
		let source = FileSource::open(&scratch).await?;
		decrypt_stream(source, total, segments, asset_id, account, output, &part, metrics, progress).await
	};

	match result {
		Ok(()) => {
			// The scratch is only useful for resume; drop it on success.
			let _ = tokio::fs::remove_file(&scratch).await;
			Ok(())
		}
		Err(err) => {
			// Never leave a partial output behind; the scratch stays for resume.
			let _ = tokio::fs::remove_file(&part).await;
			Err(err)
		}
	}
}

/// The decrypt zone: single-threaded over the box reader, key session, CBCS
/// decryptor, and rewriter, emitting fragments in order.
#[allow(clippy::too_many_arguments)]
async fn decrypt_stream<S: ByteSource>(
	source: S,
	total: u64,
	segments: &[Segment],
	asset_id: &str,
	account: &Account,
	output: &Path,
	part: &Path,
	metrics: &Metrics,
	progress: Option<ProgressSender>,
) -> Result<()> {
	let mut reader = BoxReader::new(source);

	let file = tokio::fs::File::create(part).await.map_err(Error::Output)?;
	let mut out = BufWriter::new(file);

	let mut init = reader.read_init().await?;
	let tracks = init::transform(&mut init)?;

	let mut buf = BytesMut::new();
	init.encode(&mut buf)?;
	out.write_all(&buf).await.map_err(Error::Output)?;

	let mut session = KeySession::connect(&account.key_addr).await?;
	let mut meter = Meter::new(Stage::Decrypt, total, progress);
	let mut index = 0usize;

	while let Some(mut frag) = reader.next_fragment().await? {
		if index >= segments.len() {
			return Err(Error::SegmentsExhausted(index));
		}

		if let Some(key) = &segments[index].key {
			session.handshake(asset_id, key, index == 0).await?;
		}

		decrypt::decrypt_fragment(&mut frag, &tracks, &mut session).await?;
		rewrite::rewrite_fragment(&mut frag)?;

		buf.clear();
		frag.encode(&mut buf)?;
		out.write_all(&buf).await.map_err(Error::Output)?;

		metrics.record_fragment();
		meter.update(reader.offset());
		index += 1;
	}

	session.terminate().await?;
	out.flush().await.map_err(Error::Output)?;

	// Finalizing: publish atomically.
	debug!(fragments = index, "finalizing");
	tokio::fs::rename(part, output).await.map_err(Error::Output)?;
	meter.finish();

	Ok(())
}

/// `target.m4a` → `target.m4a<suffix>`, in the target's directory.
fn suffixed(target: &Path, suffix: &str) -> PathBuf {
	let mut name = target.file_name().unwrap_or_default().to_os_string();
	name.push(suffix);
	target.with_file_name(name)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn account(name: &str, storefront: &str) -> Account {
		Account {
			name: name.to_string(),
			key_addr: "127.0.0.1:0".to_string(),
			storefront: storefront.to_string(),
		}
	}

	#[test]
	fn accounts_prefer_matching_storefront() {
		let accounts = vec![account("a", "jp"), account("b", "us"), account("c", "jp"), account("d", "us")];

		let ordered: Vec<_> = order_accounts(&accounts, "us")
			.into_iter()
			.map(|acc| acc.name.as_str())
			.collect();
		assert_eq!(ordered, vec!["b", "d", "a", "c"]);
	}

	#[test]
	fn accounts_keep_order_without_storefront() {
		let accounts = vec![account("a", "jp"), account("b", "us")];
		let ordered: Vec<_> = order_accounts(&accounts, "")
			.into_iter()
			.map(|acc| acc.name.as_str())
			.collect();
		assert_eq!(ordered, vec!["a", "b"]);
	}

	#[test]
	fn suffixed_stays_in_target_directory() {
		let path = suffixed(Path::new("/music/track.m4a"), ".tmp_download");
		assert_eq!(path, Path::new("/music/track.m4a.tmp_download"));

		let path = suffixed(Path::new("/music/track.m4a"), ".part");
		assert_eq!(path, Path::new("/music/track.m4a.part"));
	}
}
