mod config;
mod log;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use unseal::progress::{Progress, Stage};
use url::Url;

use config::Config;

#[derive(Parser, Clone)]
#[command(name = "unseal", about = "Decrypt CBCS-protected byterange HLS into clean fMP4")]
pub struct Cli {
	#[command(flatten)]
	log: log::Log,

	/// The media playlist to ingest.
	#[arg(long, value_name = "URL", conflicts_with = "resolve")]
	playlist: Option<Url>,

	/// Ask the resolver service on this address for the playlist URL instead
	/// of passing one directly.
	#[arg(long, value_name = "ADDR")]
	resolve: Option<String>,

	/// Where the decrypted file ends up.
	#[arg(long, short)]
	output: PathBuf,

	/// Asset id transmitted to the key service.
	#[arg(long)]
	asset_id: String,

	/// Storefront of the asset; matching accounts are tried first.
	#[arg(long, default_value = "")]
	storefront: String,

	/// Accounts file (TOML).
	#[arg(long, default_value = "accounts.toml")]
	config: PathBuf,

	/// Extra account as `name,key_addr[,storefront]`; may repeat. Appended
	/// after the accounts from the config file.
	#[arg(long = "account", value_name = "SPEC")]
	accounts: Vec<String>,

	/// Parallel download chunks.
	#[arg(long)]
	chunks: Option<usize>,

	/// Stream ranges straight into the decrypt loop instead of staging the
	/// file on disk first.
	#[arg(long)]
	streaming: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	cli.log.init();

	let config = Config::load(&cli.config, &cli.accounts)?;
	let cfg = config.run_config(cli.chunks, cli.streaming);

	let playlist = match (&cli.playlist, &cli.resolve) {
		(Some(url), _) => url.clone(),
		(None, Some(addr)) => {
			let url = unseal::keys::resolve_playlist_url(addr, &cli.asset_id)
				.await
				.context("resolver query failed")?;
			url.parse().context("resolver returned an unparseable url")?
		}
		(None, None) => anyhow::bail!("either --playlist or --resolve is required"),
	};

	let metrics = unseal::Metrics::new();
	let (tx, rx) = unseal::progress::channel();
	let printer = tokio::spawn(print_progress(rx));

	let result = unseal::run(
		&cli.asset_id,
		&playlist,
		&cli.output,
		&config.accounts,
		&cli.storefront,
		&cfg,
		&metrics,
		Some(tx),
	)
	.await;

	let _ = printer.await;

	let snapshot = metrics.snapshot();
	tracing::info!(
		bytes = snapshot.bytes_downloaded,
		fragments = snapshot.fragments_decrypted,
		retries = snapshot.download_retries,
		attempts = snapshot.attempts,
		"run finished"
	);

	result.map_err(Into::into)
}

async fn print_progress(mut rx: unseal::progress::ProgressReceiver) {
	while let Some(Progress {
		stage,
		percentage,
		bytes_per_second,
	}) = rx.recv().await
	{
		let stage = match stage {
			Stage::Download => "download",
			Stage::Decrypt => "decrypt",
		};
		eprint!("\r{stage}: {percentage:3}% ({:.1} MiB/s)  ", bytes_per_second / (1024.0 * 1024.0));
		if percentage == 100 {
			eprintln!();
		}
	}
}
