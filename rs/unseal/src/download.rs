//! Parallel ranged download into the scratch file, with resume.
//!
//! The media file is split into N disjoint chunks, each fetched by its own
//! task writing at its own offset. Nothing is locked: ranges never overlap
//! and the only shared state is a byte-count channel feeding one aggregator.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use crate::metrics::Metrics;
use crate::progress::{Meter, ProgressSender, SAMPLE_INTERVAL, Stage};
use crate::{Category, Error, Result, RunConfig};

/// Attempts per chunk before the transport error escapes.
const RANGE_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
	pub index: usize,
	/// Inclusive range within the media file.
	pub start: u64,
	pub end: u64,
}

/// Size of the remote file via HEAD.
pub async fn head_size(client: &Client, url: &Url, timeout: Duration) -> Result<u64> {
	let response = client
		.head(url.clone())
		.timeout(timeout)
		.send()
		.await?
		.error_for_status()?;

	match response.content_length() {
		Some(size) if size > 0 => Ok(size),
		_ => Err(Error::SizeUnknown),
	}
}

/// Split `total` bytes into `count` slices; the last absorbs the remainder.
pub fn chunk_plan(total: u64, count: usize) -> Vec<Chunk> {
	let count = count.max(1) as u64;
	let size = total / count;
	if size == 0 {
		// Fewer bytes than chunks; one range covers everything.
		return vec![Chunk {
			index: 0,
			start: 0,
			end: total.saturating_sub(1),
		}];
	}

	(0..count)
		.map(|i| Chunk {
			index: i as usize,
			start: i * size,
			end: if i == count - 1 { total - 1 } else { (i + 1) * size - 1 },
		})
		.collect()
}

/// Whether a chunk from a previous run can be skipped.
///
/// A complete scratch file skips everything; otherwise a chunk counts as done
/// only when bytes beyond it exist on disk. The chunk holding the current end
/// of file is re-requested in full, since its tail may be missing.
pub fn chunk_complete(chunk: &Chunk, disk_len: u64, total: u64) -> bool {
	disk_len == total || chunk.end + 1 < disk_len
}

/// Download `url` into the scratch file at `path`, resuming whatever a
/// previous run left behind. On success the file holds exactly `total` bytes;
/// on failure it is left in place for the next attempt.
pub async fn download(
	client: &Client,
	url: &Url,
	path: &Path,
	total: u64,
	cfg: &RunConfig,
	metrics: &Metrics,
	progress: Option<ProgressSender>,
) -> Result<()> {
	let disk_len = match tokio::fs::metadata(path).await {
		Ok(meta) => meta.len(),
		Err(_) => {
			tokio::fs::File::create(path).await.map_err(Error::Scratch)?;
			0
		}
	};

	let plan = chunk_plan(total, cfg.chunk_count);
	let single = plan.len() == 1;
	let pending: Vec<Chunk> = plan
		.iter()
		.copied()
		.filter(|chunk| !chunk_complete(chunk, disk_len, total))
		.collect();

	debug!(
		total,
		disk_len,
		chunks = plan.len(),
		pending = pending.len(),
		"download plan"
	);

	if pending.is_empty() {
		let mut meter = Meter::new(Stage::Download, total, progress);
		meter.finish();
		return Ok(());
	}

	let resumed: u64 = plan
		.iter()
		.filter(|chunk| chunk_complete(chunk, disk_len, total))
		.map(|chunk| chunk.end - chunk.start + 1)
		.sum();

	let (tx, rx) = mpsc::channel::<u64>(pending.len() * 8);
	let reporter = tokio::spawn(aggregate(rx, total, resumed, progress));

	let mut tasks = JoinSet::new();
	for chunk in pending {
		let client = client.clone();
		let url = url.clone();
		let path = path.to_owned();
		let tx = tx.clone();
		let metrics = metrics.clone();
		let timeout = cfg.download_timeout;

		tasks.spawn(async move { fetch_chunk(&client, &url, chunk, &path, timeout, single, tx, metrics).await });
	}
	drop(tx);

	// Completion is a barrier; the decrypt zone must not observe holes.
	let mut first_error = None;
	while let Some(joined) = tasks.join_next().await {
		let result = joined.map_err(|err| Error::Scratch(std::io::Error::other(err)))?;
		if let Err(err) = result {
			if first_error.is_none() {
				first_error = Some(err);
			}
		}
	}
	let _ = reporter.await;

	if let Some(err) = first_error {
		return Err(err);
	}

	let written = tokio::fs::metadata(path).await.map_err(Error::Scratch)?.len();
	if written != total {
		return Err(Error::Scratch(std::io::Error::new(
			std::io::ErrorKind::InvalidData,
			format!("scratch holds {written} bytes, expected {total}"),
		)));
	}

	Ok(())
}

/// One chunk, retried on transport errors. Each try rewrites the chunk from
/// its start, so a partial body never leaves a seam.
#[allow(clippy::too_many_arguments)]
async fn fetch_chunk(
	client: &Client,
	url: &Url,
	chunk: Chunk,
	path: &Path,
	timeout: Duration,
	allow_full: bool,
	tx: mpsc::Sender<u64>,
	metrics: Metrics,
) -> Result<()> {
	let mut last = None;

	for attempt in 1..=RANGE_ATTEMPTS {
		if attempt > 1 {
			metrics.record_retry();
			tokio::time::sleep(RETRY_BACKOFF * (attempt - 1)).await;
		}

		match try_fetch_chunk(client, url, chunk, path, timeout, allow_full, &tx, &metrics).await {
			Ok(()) => return Ok(()),
			Err(err) if err.category() == Category::Transport => {
				warn!(chunk = chunk.index, attempt, %err, "chunk failed, retrying");
				last = Some(err);
			}
			Err(err) => return Err(err),
		}
	}

	Err(last.expect("retry loop always records an error"))
}

#[allow(clippy::too_many_arguments)]
async fn try_fetch_chunk(
	client: &Client,
	url: &Url,
	chunk: Chunk,
	path: &Path,
	timeout: Duration,
	allow_full: bool,
	tx: &mpsc::Sender<u64>,
	metrics: &Metrics,
) -> Result<()> {
	let mut file = tokio::fs::OpenOptions::new()
		.write(true)
		.open(path)
		.await
		.map_err(Error::Scratch)?;
	file.seek(SeekFrom::Start(chunk.start)).await.map_err(Error::Scratch)?;

	let mut response = client
		.get(url.clone())
		.header(RANGE, format!("bytes={}-{}", chunk.start, chunk.end))
		.timeout(timeout)
		.send()
		.await?;

	match response.status() {
		StatusCode::PARTIAL_CONTENT => {}
		StatusCode::OK if allow_full => {}
		status => return Err(Error::BadRangeStatus(status)),
	}

	let expected = chunk.end - chunk.start + 1;
	let mut written = 0u64;
	while let Some(bytes) = response.chunk().await? {
		file.write_all(&bytes).await.map_err(Error::Scratch)?;
		written += bytes.len() as u64;
		metrics.record_downloaded(bytes.len() as u64);
		let _ = tx.send(bytes.len() as u64).await;
	}
	file.flush().await.map_err(Error::Scratch)?;

	if written < expected {
		// Short body; counts as a transport failure so it is retried.
		return Err(Error::MediaRead(std::io::Error::new(
			std::io::ErrorKind::UnexpectedEof,
			format!("chunk {}: got {written} of {expected} bytes", chunk.index),
		)));
	}

	Ok(())
}

/// Single consumer of all per-task byte counts; emits one progress record at
/// most every [SAMPLE_INTERVAL] and a terminal record when the tasks finish.
async fn aggregate(mut rx: mpsc::Receiver<u64>, total: u64, resumed: u64, progress: Option<ProgressSender>) {
	let mut meter = Meter::new(Stage::Download, total, progress);
	let mut downloaded = resumed;
	let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);

	loop {
		tokio::select! {
			received = rx.recv() => match received {
				Some(bytes) => downloaded += bytes,
				None => {
					meter.finish();
					return;
				}
			},
			_ = ticker.tick() => meter.update(downloaded),
		}
	}
}

/// One ranged GET with the shared retry policy; used by the streaming source.
pub(crate) async fn fetch_range(
	client: &Client,
	url: &Url,
	start: u64,
	end: u64,
	timeout: Duration,
	allow_full: bool,
	metrics: &Metrics,
) -> Result<Bytes> {
	let mut last = None;

	for attempt in 1..=RANGE_ATTEMPTS {
		if attempt > 1 {
			metrics.record_retry();
			tokio::time::sleep(RETRY_BACKOFF * (attempt - 1)).await;
		}

		let result: Result<Bytes> = async {
			let response = client
				.get(url.clone())
				.header(RANGE, format!("bytes={start}-{end}"))
				.timeout(timeout)
				.send()
				.await?;

			match response.status() {
				StatusCode::PARTIAL_CONTENT => {}
				StatusCode::OK if allow_full => {}
				status => return Err(Error::BadRangeStatus(status)),
			}

			Ok(response.bytes().await?)
		}
		.await;

		match result {
			Ok(bytes) => return Ok(bytes),
			Err(err) if err.category() == Category::Transport => {
				warn!(start, end, attempt, %err, "range failed, retrying");
				last = Some(err);
			}
			Err(err) => return Err(err),
		}
	}

	Err(last.expect("retry loop always records an error"))
}
