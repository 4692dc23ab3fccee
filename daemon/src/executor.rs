use std::{path::PathBuf, time::Duration};

use relay_core::{AdaptiveParams, Direction, Settings, TaskId, TaskKind};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Output lines kept for the task result.
pub const OUTPUT_TAIL: usize = 20;

#[derive(Debug, Error)]
pub enum ExecError {
	#[error("failed to start transfer: {0}")]
	Start(String),
}

/// Per-invocation options, fixed at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
	pub compress: bool,
	pub timeout: Duration,
	pub ssh_port: u16,
	pub identity_file: Option<PathBuf>,
	pub excludes: Vec<String>,
	pub rsync_path: String,
	pub extra_args: Vec<String>,
}

impl TransferOptions {
	pub fn new(settings: &Settings, params: &AdaptiveParams) -> Self {
		TransferOptions {
			compress: params.compression_enabled,
			timeout: params.timeout,
			ssh_port: settings.remote.port,
			identity_file: settings.remote.identity_file.clone(),
			excludes: settings.transfer.exclude.clone(),
			rsync_path: settings.transfer.rsync_path.clone(),
			extra_args: settings.transfer.extra_args.clone(),
		}
	}
}

/// Everything an executor needs to run one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
	pub task: TaskId,
	pub kind: TaskKind,
	pub direction: Direction,
	pub source: String,
	pub destination: String,
	/// Root-relative file list for batches; empty otherwise.
	pub files: Vec<PathBuf>,
	pub options: TransferOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
	pub code: Option<i32>,
	pub bytes: Option<u64>,
	pub output: Vec<String>,
}

impl ExitReport {
	pub fn ok(bytes: Option<u64>) -> Self {
		ExitReport { code: Some(0), bytes, output: Vec::new() }
	}

	pub fn failed(code: Option<i32>, output: Vec<String>) -> Self {
		ExitReport { code, bytes: None, output }
	}

	pub fn success(&self) -> bool {
		self.code == Some(0)
	}

	/// Last non-empty output line, or the exit code.
	pub fn summary(&self) -> String {
		self.output
			.iter()
			.rev()
			.find(|l| !l.trim().is_empty())
			.cloned()
			.unwrap_or_else(|| match self.code {
				Some(code) => format!("exit code {code}"),
				None => "terminated".to_string(),
			})
	}
}

#[derive(Debug)]
pub enum ExecEventKind {
	Progress(String),
	Finished(ExitReport),
}

/// Message from a running invocation back to the pool. `dispatch` tells
/// attempts of the same task apart so stale reports can be dropped.
#[derive(Debug)]
pub struct ExecEvent {
	pub task: TaskId,
	pub dispatch: u64,
	pub kind: ExecEventKind,
}

/// Line-oriented progress plus exactly one completion. Dropping an
/// unfinished reporter reports a failure, so a task can never hang in running.
#[derive(Debug)]
pub struct Reporter {
	task: TaskId,
	dispatch: u64,
	tx: Option<mpsc::UnboundedSender<ExecEvent>>,
}

impl Reporter {
	pub fn new(task: TaskId, dispatch: u64, tx: mpsc::UnboundedSender<ExecEvent>) -> Self {
		Reporter { task, dispatch, tx: Some(tx) }
	}

	pub fn task(&self) -> TaskId {
		self.task
	}

	pub fn progress(&self, line: impl Into<String>) {
		if let Some(tx) = &self.tx {
			let _ = tx.send(ExecEvent { task: self.task, dispatch: self.dispatch, kind: ExecEventKind::Progress(line.into()) });
		}
	}

	pub fn finish(mut self, report: ExitReport) {
		self.send_finished(report);
	}

	fn send_finished(&mut self, report: ExitReport) {
		if let Some(tx) = self.tx.take() {
			let _ = tx.send(ExecEvent { task: self.task, dispatch: self.dispatch, kind: ExecEventKind::Finished(report) });
		}
	}
}

impl Drop for Reporter {
	fn drop(&mut self) {
		self.send_finished(ExitReport::failed(None, vec!["executor stopped without reporting".into()]));
	}
}

/// Best-effort termination request for a running invocation. Dropping the
/// handle counts as a request.
#[derive(Debug)]
pub struct ExecHandle {
	kill: Option<oneshot::Sender<()>>,
}

impl ExecHandle {
	/// Returns false when the invocation already went away.
	pub fn terminate(&mut self) -> bool {
		self.kill.take().map(|tx| tx.send(()).is_ok()).unwrap_or(false)
	}
}

/// Executor side of an [`ExecHandle`].
#[derive(Debug)]
pub struct KillSignal {
	rx: Option<oneshot::Receiver<()>>,
}

impl KillSignal {
	/// Resolves once termination was requested. Safe to await repeatedly.
	pub async fn requested(&mut self) {
		if let Some(rx) = self.rx.as_mut() {
			let _ = rx.await;
			self.rx = None;
		}
	}

	pub fn is_requested(&mut self) -> bool {
		match self.rx.as_mut() {
			None => true,
			Some(rx) => match rx.try_recv() {
				Err(oneshot::error::TryRecvError::Empty) => false,
				_ => {
					self.rx = None;
					true
				}
			},
		}
	}
}

pub fn kill_switch() -> (ExecHandle, KillSignal) {
	let (tx, rx) = oneshot::channel();
	(ExecHandle { kill: Some(tx) }, KillSignal { rx: Some(rx) })
}

/// Runs the actual transfer. `start` must return immediately; the
/// invocation reports through `reporter` from its own task.
pub trait TransferExecutor: Send + Sync + 'static {
	fn start(&self, invocation: Invocation, reporter: Reporter) -> Result<ExecHandle, ExecError>;
}

/// Reports every invocation as successful without touching the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

impl TransferExecutor for DryRunExecutor {
	fn start(&self, invocation: Invocation, reporter: Reporter) -> Result<ExecHandle, ExecError> {
		let (handle, mut kill) = kill_switch();
		tokio::spawn(async move {
			if kill.is_requested() {
				reporter.finish(ExitReport::failed(None, vec!["terminated".into()]));
				return;
			}
			if invocation.files.is_empty() {
				reporter.progress(format!("would copy {} -> {}", invocation.source, invocation.destination));
			} else {
				for file in &invocation.files {
					reporter.progress(format!("would copy {}", file.display()));
				}
			}
			reporter.finish(ExitReport::ok(Some(0)));
		});
		Ok(handle)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn dropped_reporter_reports_failure() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let id = TaskId::new();
		drop(Reporter::new(id, 7, tx));

		let event = rx.recv().await.unwrap();
		assert_eq!(event.task, id);
		assert_eq!(event.dispatch, 7);
		match event.kind {
			ExecEventKind::Finished(report) => assert!(!report.success()),
			other => panic!("unexpected event {other:?}"),
		}
	}

	#[tokio::test]
	async fn finish_reports_exactly_once() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let reporter = Reporter::new(TaskId::new(), 1, tx);
		reporter.progress("halfway");
		reporter.finish(ExitReport::ok(Some(10)));

		assert!(matches!(rx.recv().await.unwrap().kind, ExecEventKind::Progress(_)));
		assert!(matches!(rx.recv().await.unwrap().kind, ExecEventKind::Finished(r) if r.success()));
		assert!(rx.recv().await.is_none());
	}

	#[tokio::test]
	async fn kill_switch_fires_once() {
		let (mut handle, mut kill) = kill_switch();
		assert!(!kill.is_requested());
		assert!(handle.terminate());
		kill.requested().await;
		kill.requested().await;
		assert!(kill.is_requested());
		assert!(!handle.terminate());
	}

	#[tokio::test]
	async fn dropped_handle_counts_as_termination() {
		let (handle, mut kill) = kill_switch();
		drop(handle);
		kill.requested().await;
	}

	#[test]
	fn summary_prefers_last_output_line() {
		let report = ExitReport::failed(Some(23), vec!["first".into(), "last".into(), "  ".into()]);
		assert_eq!(report.summary(), "last");
		assert_eq!(ExitReport::failed(Some(5), Vec::new()).summary(), "exit code 5");
	}
}
