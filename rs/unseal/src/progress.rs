use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// How often progress records are emitted, per stage.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
	Download,
	Decrypt,
}

/// A single progress record. A terminal `{100, 0.0}` record is emitted at
/// each stage boundary.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
	pub stage: Stage,
	pub percentage: u8,
	pub bytes_per_second: f64,
}

pub type ProgressSender = mpsc::Sender<Progress>;
pub type ProgressReceiver = mpsc::Receiver<Progress>;

/// Create a bounded progress channel.
///
/// The channel is lossy on the sending side: the pipeline never blocks on a
/// slow consumer, it just drops the sample.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
	mpsc::channel(16)
}

/// Rate/percentage sampler for one stage.
///
/// Call [Meter::update] with the current absolute byte position; a record is
/// emitted at most every [SAMPLE_INTERVAL]. [Meter::finish] emits the terminal
/// record for the stage.
pub struct Meter {
	stage: Stage,
	total: u64,
	tx: Option<ProgressSender>,
	last_at: Instant,
	last_bytes: u64,
}

impl Meter {
	pub fn new(stage: Stage, total: u64, tx: Option<ProgressSender>) -> Self {
		Self {
			stage,
			total,
			tx,
			last_at: Instant::now(),
			last_bytes: 0,
		}
	}

	pub fn update(&mut self, bytes: u64) {
		let elapsed = self.last_at.elapsed();
		if elapsed < SAMPLE_INTERVAL {
			return;
		}

		let speed = (bytes.saturating_sub(self.last_bytes)) as f64 / elapsed.as_secs_f64();
		self.last_at = Instant::now();
		self.last_bytes = bytes;

		self.emit(percentage(bytes, self.total), speed);
	}

	pub fn finish(&mut self) {
		self.emit(100, 0.0);
	}

	fn emit(&self, percentage: u8, bytes_per_second: f64) {
		if let Some(tx) = &self.tx {
			// Lossy on purpose; a stalled consumer must not stall the pipeline.
			let _ = tx.try_send(Progress {
				stage: self.stage,
				percentage,
				bytes_per_second,
			});
		}
	}
}

pub(crate) fn percentage(bytes: u64, total: u64) -> u8 {
	if total == 0 {
		return 100;
	}
	((bytes * 100) / total).min(100) as u8
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn percentage_clamps() {
		assert_eq!(percentage(0, 1000), 0);
		assert_eq!(percentage(500, 1000), 50);
		assert_eq!(percentage(2000, 1000), 100);
		assert_eq!(percentage(0, 0), 100);
	}

	#[tokio::test]
	async fn meter_samples_and_finishes() {
		let (tx, mut rx) = channel();
		let mut meter = Meter::new(Stage::Download, 1000, Some(tx));

		// Too early, nothing emitted.
		meter.update(100);
		assert!(rx.try_recv().is_err());

		tokio::time::sleep(Duration::from_millis(600)).await;
		meter.update(600);
		let p = rx.try_recv().unwrap();
		assert_eq!(p.stage, Stage::Download);
		assert_eq!(p.percentage, 60);
		assert!(p.bytes_per_second > 0.0);

		meter.finish();
		let p = rx.try_recv().unwrap();
		assert_eq!(p.percentage, 100);
		assert_eq!(p.bytes_per_second, 0.0);
	}
}
