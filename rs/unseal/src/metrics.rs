use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cheaply cloneable counter handle owned by the orchestrator.
///
/// Counters are cumulative across attempts and resumes.
#[derive(Clone, Default)]
pub struct Metrics {
	bytes_downloaded: Arc<AtomicU64>,
	download_retries: Arc<AtomicU64>,
	fragments_decrypted: Arc<AtomicU64>,
	attempts: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
	pub bytes_downloaded: u64,
	pub download_retries: u64,
	pub fragments_decrypted: u64,
	pub attempts: u64,
}

impl Metrics {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_downloaded(&self, bytes: u64) {
		self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
	}

	pub fn record_retry(&self) {
		self.download_retries.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_fragment(&self) {
		self.fragments_decrypted.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_attempt(&self) {
		self.attempts.fetch_add(1, Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
			download_retries: self.download_retries.load(Ordering::Relaxed),
			fragments_decrypted: self.fragments_decrypted.load(Ordering::Relaxed),
			attempts: self.attempts.load(Ordering::Relaxed),
		}
	}
}
