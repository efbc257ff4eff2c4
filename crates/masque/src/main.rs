use clap::Parser as _;
use masque_core::{context::AppContext, info, types::ProcessConfig};
use tracing::Level;

use crate::cli::{Cli, Commands, ConfigFormat};

mod cli;
mod conf;
mod log;
mod wiring;

fn main() -> eyre::Result<()> {
	let mut builder = tokio::runtime::Builder::new_multi_thread();
	builder.enable_all();
	if let Ok(threads) = std::env::var("THREADS")
		&& let Ok(threads) = threads.parse::<usize>()
		&& threads > 0
	{
		builder.worker_threads(threads);
	}
	let runtime = builder.build()?;
	runtime.block_on(run())
}

async fn run() -> eyre::Result<()> {
	log::init_log(Level::INFO)?;
	info!(target: "[MAIN]", "masque starting");
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let cli = match Cli::try_parse() {
		Ok(v) => v,
		Err(err) => {
			println!("{err:#}");
			return Ok(());
		}
	};

	if cli.version {
		const VER: &str = match option_env!("MASQUE_OVERRIDE_VERSION") {
			Some(v) => v,
			None => env!("CARGO_PKG_VERSION"),
		};
		println!("masque {VER}");
		return Ok(());
	}

	if let Some(work_dir) = &cli.work_dir {
		std::env::set_current_dir(work_dir)?;
	}

	let Some(command) = cli.command else {
		println!("no subcommand given, try `masque server` or `masque client` (see --help)");
		return Ok(());
	};

	match command {
		Commands::Init { format } => {
			let persist = conf::PersistentConfig::default();
			let (path, format_str) = match format {
				ConfigFormat::Yaml => ("masque.yaml", "yaml"),
				ConfigFormat::Toml => ("masque.toml", "toml"),
			};
			persist.export_to_file(&std::path::PathBuf::from(path), format_str)?;
			println!("wrote default configuration to {path}");
			Ok(())
		}
		Commands::Test { list } => {
			let persist = conf::PersistentConfig::load(cli.config)?;
			if list {
				println!("{persist:#?}");
			}
			println!("configuration is valid");
			Ok(())
		}
		Commands::Server(server_args) => {
			let persist = conf::PersistentConfig::load(cli.config)?;
			let qlog_set = server_args.qlog.is_some();
			let config = conf::Config::from_persist(persist, Some(&server_args), None)?;
			run_with_context(qlog_set, move |ctx| wiring::run_server(ctx, config.server)).await
		}
		Commands::Client(client_args) => {
			let persist = conf::PersistentConfig::load(cli.config)?;
			let config = conf::Config::from_persist(persist, None, Some(&client_args))?;
			run_with_context(false, move |ctx| wiring::run_client(ctx, config.client)).await
		}
	}
}

/// Runs `body` under a shared [`AppContext`], installing a SIGTERM handler
/// that trips the context's cancellation token unless a qlog path is
/// configured (spec §6 addendum: QUIC needs to flush its own qlog on exit in
/// that case, so an abrupt signal-driven shutdown is skipped).
async fn run_with_context<F, Fut>(qlog_set: bool, body: F) -> eyre::Result<()>
where
	F: FnOnce(AppContext) -> Fut,
	Fut: Future<Output = eyre::Result<()>>,
{
	let ctx = AppContext::with_config(ProcessConfig::default());

	if !qlog_set {
		let sigterm_ctx = ctx.clone();
		ctx.tasks.spawn(async move {
			if let Ok(mut signal) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
				signal.recv().await;
				info!(target: "[MAIN]", "received SIGTERM, shutting down");
				sigterm_ctx.token.cancel();
			}
		});
	}

	let result = body(ctx.clone()).await;
	ctx.shutdown().await;
	result
}
