mod commands;
mod output;

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use console::style;
use relay_core::settings::data_dir;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version, about = "Batch and schedule rsync transfers to a remote host", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
	/// Config file (default: ~/.config/relay/config.toml)
	#[arg(long, global = true)]
	pub config: Option<PathBuf>,

	/// Increase verbosity (-v, -vv, -vvv)
	#[arg(short, long, action = clap::ArgAction::Count, global = true)]
	pub verbose: u8,

	/// Report every transfer as successful without running rsync
	#[arg(long, global = true)]
	pub dry_run: bool,

	/// Print the final summary as JSON
	#[arg(long, global = true)]
	pub json: bool,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Copy local files or directories to the remote
	Upload {
		#[arg(required = true)]
		paths: Vec<PathBuf>,
		/// Give up on unfinished transfers after this many seconds
		#[arg(long, default_value = "3600")]
		timeout: u64,
	},
	/// Copy remote files or directories (trailing slash) into the local root
	Download {
		#[arg(required = true)]
		paths: Vec<PathBuf>,
		#[arg(long, default_value = "3600")]
		timeout: u64,
	},
	/// Upload everything under the local root that passes the filters
	Sync {
		#[arg(long, default_value = "3600")]
		timeout: u64,
	},
	/// Check that the remote is reachable and show the derived transfer parameters
	Probe,
	/// Print the resolved configuration
	Config,
}

fn init_logging(verbose: u8) -> Option<WorkerGuard> {
	let level = match verbose {
		0 => "warn",
		1 => "info",
		2 => "debug",
		_ => "trace",
	};
	let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

	let log_dir = data_dir();
	let file_layer = std::fs::create_dir_all(&log_dir).ok().map(|_| {
		let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, "relay.log"));
		(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer).with_filter(filter()), guard)
	});
	let (file_layer, guard) = match file_layer {
		Some((layer, guard)) => (Some(layer), Some(guard)),
		None => (None, None),
	};

	tracing_subscriber::registry()
		.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(filter()))
		.with(file_layer)
		.init();
	guard
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	let _guard = init_logging(cli.verbose);

	match commands::run(cli).await {
		Ok(true) => ExitCode::SUCCESS,
		Ok(false) => ExitCode::FAILURE,
		Err(e) => {
			eprintln!("{} {e:#}", style("error:").red().bold());
			ExitCode::FAILURE
		}
	}
}
