use clap::Args;
use tracing_subscriber::EnvFilter;

#[derive(Args, Clone)]
pub struct Log {
	/// Log level when RUST_LOG is not set.
	#[arg(long = "log-level", default_value = "info")]
	pub level: String,
}

impl Log {
	pub fn init(&self) {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

		tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_writer(std::io::stderr)
			.init();
	}
}
