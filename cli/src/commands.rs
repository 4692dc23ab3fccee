use std::{
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use anyhow::{Context, Result};
use relay_core::{
	task::relative_to, AdaptiveController, Direction, Settings, SharedSettings, TaskId, TaskOutcome, TaskRequest,
};
use relay_daemon::{DryRunExecutor, PoolHandle, ProbeWatcher, RsyncExecutor, TransferExecutor};
use tracing::{debug, info};

use crate::{
	output::{self, Progress},
	Cli, Commands,
};

/// Returns Ok(false) when the command ran but something failed.
pub async fn run(cli: Cli) -> Result<bool> {
	let mut settings = Settings::load_or_default(cli.config.as_deref())?;

	if let Commands::Config = cli.command {
		print!("{}", toml::to_string_pretty(&settings).context("cannot render configuration")?);
		return Ok(true);
	}

	settings.validate()?;
	settings.transfer.local_root = std::path::absolute(&settings.transfer.local_root)
		.with_context(|| format!("cannot resolve {}", settings.transfer.local_root.display()))?;

	let flags = Flags { dry_run: cli.dry_run, json: cli.json };
	match cli.command {
		Commands::Upload { paths, timeout } => {
			transfer(settings, flags, Direction::Upload, paths, Duration::from_secs(timeout)).await
		}
		Commands::Download { paths, timeout } => {
			transfer(settings, flags, Direction::Download, paths, Duration::from_secs(timeout)).await
		}
		Commands::Sync { timeout } => sync(settings, flags, Duration::from_secs(timeout)).await,
		Commands::Probe => probe(settings, flags).await,
		Commands::Config => Ok(true),
	}
}

#[derive(Debug, Clone, Copy)]
struct Flags {
	dry_run: bool,
	json: bool,
}

struct Session {
	pool: PoolHandle,
	watcher: Option<ProbeWatcher>,
}

impl Session {
	fn start(settings: Settings, dry_run: bool) -> Session {
		let executor: Arc<dyn TransferExecutor> = if dry_run { Arc::new(DryRunExecutor) } else { Arc::new(RsyncExecutor) };
		let probe = settings.probe.enabled && !dry_run;
		let shared = SharedSettings::new(settings);
		let pool = PoolHandle::spawn(shared.clone(), executor);
		let watcher = probe.then(|| ProbeWatcher::start(pool.clone(), shared));
		Session { pool, watcher }
	}

	async fn close(self) -> Result<()> {
		if let Some(watcher) = self.watcher {
			watcher.stop();
		}
		self.pool.shutdown().await?;
		Ok(())
	}
}

async fn transfer(
	settings: Settings,
	flags: Flags,
	direction: Direction,
	paths: Vec<PathBuf>,
	timeout: Duration,
) -> Result<bool> {
	let targets = resolve_targets(&settings.transfer.local_root, direction, paths).await?;
	let session = Session::start(settings, flags.dry_run);

	let ids = match submit_targets(&session.pool, direction, targets).await {
		Ok(ids) => ids,
		Err(e) => {
			session.close().await?;
			return Err(e);
		}
	};
	info!(tasks = ids.len(), %direction, "submitted");

	finish(session, ids, timeout, flags.json).await
}

/// Paths split into directory tasks and loose files, checked before anything starts.
#[derive(Debug, Default, PartialEq)]
struct Targets {
	directories: Vec<PathBuf>,
	files: Vec<PathBuf>,
}

async fn resolve_targets(root: &Path, direction: Direction, paths: Vec<PathBuf>) -> Result<Targets> {
	let mut targets = Targets::default();
	for path in paths {
		match direction {
			Direction::Upload => {
				let path = std::path::absolute(&path).with_context(|| format!("cannot resolve {}", path.display()))?;
				relative_to(root, &path)?;
				let meta =
					tokio::fs::metadata(&path).await.with_context(|| format!("cannot read {}", path.display()))?;
				if meta.is_dir() {
					targets.directories.push(path);
				} else {
					targets.files.push(path);
				}
			}
			Direction::Download => {
				relative_to(root, &path)?;
				if is_dir_spec(&path) {
					targets.directories.push(path);
				} else {
					targets.files.push(path);
				}
			}
		}
	}
	Ok(targets)
}

async fn submit_targets(pool: &PoolHandle, direction: Direction, targets: Targets) -> Result<Vec<TaskId>> {
	let mut ids = Vec::new();
	for dir in targets.directories {
		ids.push(pool.submit(TaskRequest::directory(direction, dir)).await?);
	}
	if !targets.files.is_empty() {
		ids.extend(pool.submit_files(direction, targets.files).await?);
	}
	Ok(ids)
}

/// Remote paths written with a trailing slash name directories.
fn is_dir_spec(path: &Path) -> bool {
	let text = path.to_string_lossy();
	text.ends_with('/') && text.len() > 1
}

async fn sync(settings: Settings, flags: Flags, timeout: Duration) -> Result<bool> {
	let root = settings.transfer.local_root.clone();
	let session = Session::start(settings, flags.dry_run);

	let report = session.pool.sync_all().await?;
	if !flags.json {
		output::print_scan(&root, &report.scan);
	}
	if report.tasks.is_empty() {
		session.close().await?;
		return Ok(true);
	}

	finish(session, report.tasks, timeout, flags.json).await
}

/// Wait for every task with a live spinner, print the summary, shut down.
async fn finish(session: Session, ids: Vec<TaskId>, timeout: Duration, json: bool) -> Result<bool> {
	let progress = Progress::start(session.pool.clone(), ids.len(), json);

	let outcomes = tokio::select! {
		outcomes = wait_all(&session.pool, &ids, timeout) => outcomes?,
		_ = tokio::signal::ctrl_c() => {
			progress.abandon("interrupted, cancelling transfers");
			session.close().await?;
			return Ok(false);
		}
	};
	progress.finish();

	let status = session.pool.status().await?;
	session.close().await?;

	let ok = outcomes.iter().all(|o| o.success);
	if json {
		output::print_json(&outcomes, &status)?;
	} else {
		output::print_summary(&outcomes, &status.metrics.transfers);
	}
	Ok(ok)
}

async fn wait_all(pool: &PoolHandle, ids: &[TaskId], timeout: Duration) -> Result<Vec<TaskOutcome>> {
	let deadline = tokio::time::Instant::now() + timeout;
	let mut outcomes = Vec::with_capacity(ids.len());
	for id in ids {
		let left = deadline.saturating_duration_since(tokio::time::Instant::now());
		let outcome = pool.wait_for(*id, left).await?;
		debug!(task = %id, success = outcome.success, "task finished");
		outcomes.push(outcome);
	}
	Ok(outcomes)
}

async fn probe(settings: Settings, flags: Flags) -> Result<bool> {
	let sample = relay_daemon::probe(&settings).await?;

	let baseline = settings.baseline();
	let mut controller = AdaptiveController::new(&baseline);
	controller.observe(sample.into());
	let params = controller.refresh(&baseline);

	if flags.json {
		let value = serde_json::json!({
			"host": settings.ssh_target(),
			"reachable": sample.reachable,
			"rtt_ms": sample.rtt.map(|d| d.as_millis() as u64),
			"params": params,
		});
		println!("{}", serde_json::to_string_pretty(&value)?);
	} else {
		output::print_probe(&settings.ssh_target(), &sample, &params);
	}
	Ok(sample.reachable)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn trailing_slash_marks_remote_directories() {
		assert!(is_dir_spec(Path::new("assets/")));
		assert!(!is_dir_spec(Path::new("assets")));
		assert!(!is_dir_spec(Path::new("/")));
	}

	#[tokio::test]
	async fn targets_are_split_and_checked_up_front() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path();
		std::fs::create_dir(root.join("assets")).unwrap();
		std::fs::write(root.join("index.html"), "<html>").unwrap();

		let targets =
			resolve_targets(root, Direction::Upload, vec![root.join("assets"), root.join("index.html")]).await.unwrap();
		assert_eq!(targets.directories, vec![root.join("assets")]);
		assert_eq!(targets.files, vec![root.join("index.html")]);

		let downloads =
			resolve_targets(root, Direction::Download, vec!["assets/".into(), "index.html".into()]).await.unwrap();
		assert_eq!(downloads.directories, vec![PathBuf::from("assets/")]);
		assert_eq!(downloads.files, vec![PathBuf::from("index.html")]);
	}

	#[tokio::test]
	async fn a_path_outside_the_root_fails_before_any_transfer() {
		let tmp = tempfile::tempdir().unwrap();
		let outside = tempfile::tempdir().unwrap();
		std::fs::create_dir(tmp.path().join("assets")).unwrap();
		std::fs::write(outside.path().join("stray.txt"), "x").unwrap();

		let paths = vec![tmp.path().join("assets"), outside.path().join("stray.txt")];
		let err = resolve_targets(tmp.path(), Direction::Upload, paths).await.unwrap_err();
		assert!(err.to_string().contains("is outside"));

		let escape = resolve_targets(tmp.path(), Direction::Download, vec!["../etc/passwd".into()]).await;
		assert!(escape.is_err());
	}
}
