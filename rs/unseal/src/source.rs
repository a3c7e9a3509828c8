//! Byte sources feeding the box reader.
//!
//! Both download paths end at the same seam: the pre-download path reads the
//! scratch file back, the streaming path pulls sequential ranges straight off
//! the network. The box reader only ever sees a [ByteSource].

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use reqwest::Client;
use tokio::io::AsyncReadExt;
use url::Url;

use crate::download::fetch_range;
use crate::metrics::Metrics;
use crate::{Error, Result};

/// Sequential range size used by the streaming path.
pub const STREAM_CHUNK: u64 = 10 * 1024 * 1024;

#[allow(async_fn_in_trait)]
pub trait ByteSource {
	/// Append some bytes to `buf`, returning how many were added. Zero means
	/// end of stream.
	async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize>;
}

/// Reads the scratch file back from disk.
pub struct FileSource {
	file: tokio::fs::File,
}

impl FileSource {
	pub async fn open(path: &std::path::Path) -> Result<Self> {
		let file = tokio::fs::File::open(path).await.map_err(Error::Scratch)?;
		Ok(Self { file })
	}
}

impl ByteSource for FileSource {
	async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
		self.file.read_buf(buf).await.map_err(Error::MediaRead)
	}
}

/// Lazy sequential ranged GETs; trades download parallelism for not touching
/// the disk.
pub struct RangeSource {
	client: Client,
	url: Url,
	total: u64,
	pos: u64,
	chunk: u64,
	timeout: Duration,
	metrics: Metrics,
}

impl RangeSource {
	pub fn new(client: Client, url: Url, total: u64, chunk: u64, timeout: Duration, metrics: Metrics) -> Self {
		Self {
			client,
			url,
			total,
			pos: 0,
			chunk: chunk.max(1),
			timeout,
			metrics,
		}
	}
}

impl ByteSource for RangeSource {
	async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
		if self.pos >= self.total {
			return Ok(0);
		}

		let end = (self.pos + self.chunk).min(self.total) - 1;
		let full_file = self.pos == 0 && end + 1 == self.total;
		let bytes = fetch_range(
			&self.client,
			&self.url,
			self.pos,
			end,
			self.timeout,
			full_file,
			&self.metrics,
		)
		.await?;

		if bytes.is_empty() {
			return Err(Error::MediaRead(std::io::Error::new(
				std::io::ErrorKind::UnexpectedEof,
				"empty range response",
			)));
		}

		self.pos += bytes.len() as u64;
		self.metrics.record_downloaded(bytes.len() as u64);
		buf.extend_from_slice(&bytes);
		Ok(bytes.len())
	}
}

/// In-memory source, mostly for tests.
pub struct MemorySource {
	data: Bytes,
}

impl MemorySource {
	pub fn new(data: Bytes) -> Self {
		Self { data }
	}
}

impl ByteSource for MemorySource {
	async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
		// Hand out small pieces so callers exercise their buffering.
		let take = self.data.len().min(7);
		let piece = self.data.split_to(take);
		buf.extend_from_slice(&piece);
		Ok(piece.len())
	}
}
