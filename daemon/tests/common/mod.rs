#![allow(dead_code)]

use std::{
	fs::File,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use parking_lot::Mutex;
use relay_core::{Settings, SharedSettings};
use relay_daemon::{
	executor::kill_switch, ExecError, ExecHandle, ExitReport, Invocation, PoolHandle, Reporter, TransferExecutor,
};
use tokio::time::Instant;

/// What one scripted invocation does: wait `delay` (forever if `None`), then report.
#[derive(Debug, Clone)]
pub struct Step {
	pub delay: Option<Duration>,
	pub report: ExitReport,
}

impl Step {
	pub fn ok_after(ms: u64) -> Self {
		Step { delay: Some(Duration::from_millis(ms)), report: ExitReport::ok(Some(100)) }
	}

	pub fn fail(code: i32, line: &str) -> Self {
		Step { delay: Some(Duration::ZERO), report: ExitReport::failed(Some(code), vec![line.to_string()]) }
	}

	pub fn hang() -> Self {
		Step { delay: None, report: ExitReport::ok(None) }
	}
}

#[derive(Debug, Clone)]
pub struct Started {
	pub invocation: Invocation,
	pub at: Instant,
}

#[derive(Debug, Default)]
struct State {
	started: Vec<Started>,
	start_calls: usize,
	live: usize,
	max_live: usize,
}

type Script = Box<dyn Fn(&Invocation, usize) -> Step + Send + Sync>;

/// Executor double that records every invocation and plays back a script
/// keyed on the invocation and its global index.
pub struct ScriptedExecutor {
	state: Arc<Mutex<State>>,
	script: Script,
	fail_start: bool,
}

impl ScriptedExecutor {
	pub fn new(script: impl Fn(&Invocation, usize) -> Step + Send + Sync + 'static) -> Arc<Self> {
		Arc::new(ScriptedExecutor { state: Arc::default(), script: Box::new(script), fail_start: false })
	}

	pub fn succeeding(ms: u64) -> Arc<Self> {
		Self::new(move |_, _| Step::ok_after(ms))
	}

	pub fn hanging() -> Arc<Self> {
		Self::new(|_, _| Step::hang())
	}

	pub fn failing_to_start() -> Arc<Self> {
		Arc::new(ScriptedExecutor { state: Arc::default(), script: Box::new(|_, _| Step::hang()), fail_start: true })
	}

	pub fn started(&self) -> Vec<Started> {
		self.state.lock().started.clone()
	}

	pub fn start_calls(&self) -> usize {
		self.state.lock().start_calls
	}

	pub fn live(&self) -> usize {
		self.state.lock().live
	}

	pub fn max_live(&self) -> usize {
		self.state.lock().max_live
	}
}

impl TransferExecutor for ScriptedExecutor {
	fn start(&self, invocation: Invocation, reporter: Reporter) -> Result<ExecHandle, ExecError> {
		let step = {
			let mut state = self.state.lock();
			state.start_calls += 1;
			if self.fail_start {
				return Err(ExecError::Start("scripted start failure".into()));
			}
			let index = state.started.len();
			state.started.push(Started { invocation: invocation.clone(), at: Instant::now() });
			state.live += 1;
			state.max_live = state.max_live.max(state.live);
			(self.script)(&invocation, index)
		};

		let (handle, mut kill) = kill_switch();
		let state = self.state.clone();
		let Step { delay, report } = step;

		tokio::spawn(async move {
			let done = async move {
				match delay {
					Some(d) => tokio::time::sleep(d).await,
					None => std::future::pending::<()>().await,
				}
			};
			tokio::select! {
				_ = done => {
					state.lock().live -= 1;
					reporter.finish(report);
				}
				_ = kill.requested() => {
					state.lock().live -= 1;
					reporter.finish(ExitReport::failed(None, vec!["terminated".into()]));
				}
			}
		});

		Ok(handle)
	}
}

pub fn settings(root: &Path) -> Settings {
	let mut settings = Settings::default();
	settings.remote.host = "example.com".into();
	settings.remote.path = "/srv/app".into();
	settings.transfer.local_root = root.to_path_buf();
	settings.transfer.inter_batch_delay_ms = 0;
	settings.probe.enabled = false;
	settings
}

pub fn spawn_pool(settings: Settings, executor: Arc<ScriptedExecutor>) -> PoolHandle {
	PoolHandle::spawn(SharedSettings::new(settings), executor)
}

/// Sparse file of the given length; cheap even for large sizes.
pub fn write_file(root: &Path, name: &str, len: u64) -> PathBuf {
	let path = root.join(name);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).unwrap();
	}
	File::create(&path).unwrap().set_len(len).unwrap();
	path
}
