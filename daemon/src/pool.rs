use std::{
	collections::{BTreeMap, HashMap, HashSet, VecDeque},
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use chrono::{DateTime, Utc};
use relay_core::{
	classify, plan, task::relative_to, AdaptiveController, AdaptiveParams, Category, Direction, ErrorClass, FileEntry,
	MetricsStore, NetworkSnapshot, Observation, RetryDecision, Settings, SharedSettings, Subject, SubmitError, TaskId,
	TaskKind, TaskOutcome, TaskRequest, TaskSnapshot, TaskStatus, TransferMetrics, TransferRecord, Unit,
};
use serde::Serialize;
use thiserror::Error;
use tokio::{
	sync::{mpsc, oneshot},
	time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
	executor::{ExecEvent, ExecEventKind, ExecHandle, ExitReport, Invocation, Reporter, TransferExecutor, TransferOptions},
	scanner::{self, ScanError, ScanResult},
};

const COMMAND_BUFFER: usize = 64;
/// Finished tasks kept around for late watchers and status queries.
const RETAINED_TERMINAL: usize = 256;
const STATUS_HISTORY: usize = 20;

#[derive(Debug, Error)]
pub enum SyncError {
	#[error(transparent)]
	Scan(#[from] ScanError),

	#[error(transparent)]
	Submit(#[from] SubmitError),
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
	pub pending: usize,
	pub running: usize,
	pub params: AdaptiveParams,
	pub network: NetworkSnapshot,
	pub transfers: TransferMetrics,
}

/// Point-in-time view of the pool. Not updated after it is returned.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
	pub metrics: PoolMetrics,
	/// Running tasks first, then pending ones in admission order.
	pub active: Vec<TaskSnapshot>,
	pub recent: Vec<TransferRecord>,
}

#[derive(Debug)]
pub struct SyncReport {
	pub scan: ScanResult,
	pub tasks: Vec<TaskId>,
}

/// A validated task on its way into the queue.
#[derive(Debug)]
struct NewTask {
	kind: TaskKind,
	direction: Direction,
	subject: Subject,
	category: Category,
	bytes: u64,
	label: String,
	continuation: Option<oneshot::Sender<TaskOutcome>>,
}

#[derive(Debug)]
enum Command {
	Submit { tasks: Vec<NewTask>, reply: oneshot::Sender<Vec<TaskId>> },
	SubmitFiles { direction: Direction, files: Vec<FileEntry>, reply: oneshot::Sender<Vec<TaskId>> },
	Cancel { id: TaskId, reply: oneshot::Sender<bool> },
	Watch { id: TaskId, watcher: oneshot::Sender<TaskOutcome>, reply: oneshot::Sender<bool> },
	Status { reply: oneshot::Sender<PoolStatus> },
	Observe(Observation),
	Shutdown { reply: oneshot::Sender<()> },
}

#[derive(Debug)]
enum Timer {
	RetryDue(TaskId),
	Wake,
}

#[derive(Debug)]
struct TaskEntry {
	id: TaskId,
	kind: TaskKind,
	direction: Direction,
	subject: Subject,
	category: Category,
	label: String,
	/// Size known at submission; used when the executor reports no byte count.
	bytes: u64,
	seq: u64,
	status: TaskStatus,
	attempts: u32,
	waiting_retry: bool,
	dispatch: u64,
	handle: Option<ExecHandle>,
	created_at: DateTime<Utc>,
	started_at: Option<DateTime<Utc>>,
	dispatched_at: Option<Instant>,
	last_line: Option<String>,
	outcome: Option<TaskOutcome>,
	continuation: Option<oneshot::Sender<TaskOutcome>>,
	watchers: Vec<oneshot::Sender<TaskOutcome>>,
}

impl TaskEntry {
	fn snapshot(&self) -> TaskSnapshot {
		TaskSnapshot {
			id: self.id,
			kind: self.kind,
			direction: self.direction,
			category: self.category,
			label: self.label.clone(),
			file_count: self.subject.len(),
			status: self.status,
			attempts: self.attempts,
			waiting_retry: self.waiting_retry,
			created_at: self.created_at,
			started_at: self.started_at,
			last_line: self.last_line.clone(),
		}
	}
}

/// The scheduler. Owns every task and is the only writer of task state;
/// everything else talks to it through a [`PoolHandle`].
struct TaskPool {
	settings: SharedSettings,
	executor: Arc<dyn TransferExecutor>,
	tasks: HashMap<TaskId, TaskEntry>,
	/// Pending tasks eligible for admission, in tier then FIFO order.
	ready: BTreeMap<(Category, u64), TaskId>,
	running: HashSet<TaskId>,
	terminal: VecDeque<TaskId>,
	adaptive: AdaptiveController,
	metrics: MetricsStore,
	next_seq: u64,
	next_dispatch: u64,
	next_batch_at: Option<Instant>,
	wake_at: Option<Instant>,
	closing: bool,
	exec_tx: mpsc::UnboundedSender<ExecEvent>,
	timer_tx: mpsc::UnboundedSender<Timer>,
}

impl TaskPool {
	async fn run(
		mut self,
		mut commands: mpsc::Receiver<Command>,
		mut events: mpsc::UnboundedReceiver<ExecEvent>,
		mut timers: mpsc::UnboundedReceiver<Timer>,
	) {
		loop {
			tokio::select! {
				cmd = commands.recv() => match cmd {
					Some(Command::Shutdown { reply }) => {
						self.shutdown();
						let _ = reply.send(());
						break;
					}
					Some(cmd) => self.on_command(cmd),
					None => {
						self.shutdown();
						break;
					}
				},
				Some(event) = events.recv() => self.on_event(event),
				Some(timer) = timers.recv() => self.on_timer(timer),
			}
		}
		debug!("task pool stopped");
	}

	fn on_command(&mut self, cmd: Command) {
		match cmd {
			Command::Submit { tasks, reply } => {
				let ids = tasks.into_iter().map(|t| self.enqueue(t)).collect();
				let _ = reply.send(ids);
				self.admit();
			}
			Command::SubmitFiles { direction, files, reply } => {
				let batch_size = self.current_params().batch_size;
				let ids = plan_tasks(direction, files, batch_size).into_iter().map(|t| self.enqueue(t)).collect();
				let _ = reply.send(ids);
				self.admit();
			}
			Command::Cancel { id, reply } => {
				let _ = reply.send(self.cancel(id));
			}
			Command::Watch { id, watcher, reply } => {
				let known = match self.tasks.get_mut(&id) {
					Some(task) => {
						match &task.outcome {
							Some(outcome) => {
								let _ = watcher.send(outcome.clone());
							}
							None => task.watchers.push(watcher),
						}
						true
					}
					None => false,
				};
				let _ = reply.send(known);
			}
			Command::Status { reply } => {
				let _ = reply.send(self.status());
			}
			Command::Observe(observation) => {
				self.adaptive.observe(observation);
				self.admit();
			}
			// handled by the run loop
			Command::Shutdown { .. } => {}
		}
	}

	fn current_params(&mut self) -> AdaptiveParams {
		let baseline = self.settings.snapshot().baseline();
		self.adaptive.refresh(&baseline)
	}

	fn enqueue(&mut self, new: NewTask) -> TaskId {
		let id = TaskId::new();
		self.next_seq += 1;
		let seq = self.next_seq;

		debug!(task = %id, label = %new.label, category = %new.category, "task queued");
		self.ready.insert((new.category, seq), id);
		self.tasks.insert(
			id,
			TaskEntry {
				id,
				kind: new.kind,
				direction: new.direction,
				subject: new.subject,
				category: new.category,
				label: new.label,
				bytes: new.bytes,
				seq,
				status: TaskStatus::Pending,
				attempts: 0,
				waiting_retry: false,
				dispatch: 0,
				handle: None,
				created_at: Utc::now(),
				started_at: None,
				dispatched_at: None,
				last_line: None,
				outcome: None,
				continuation: new.continuation,
				watchers: Vec::new(),
			},
		);
		id
	}

	/// Start as many ready tasks as the current concurrency limit allows.
	/// Safe to call at any time; does nothing when there is no room or no work.
	fn admit(&mut self) {
		if self.closing {
			return;
		}
		let settings = self.settings.snapshot();
		let params = self.adaptive.refresh(&settings.baseline());

		while self.running.len() < params.max_concurrency {
			let Some((&key, &id)) = self.ready.first_key_value() else {
				break;
			};

			let is_batch = self.tasks.get(&id).is_some_and(|t| t.kind == TaskKind::Batch);
			if is_batch {
				if let Some(at) = self.next_batch_at.filter(|at| Instant::now() < *at) {
					// Nothing behind the head may jump ahead of it.
					self.schedule_wake(at);
					break;
				}
			}

			self.ready.remove(&key);
			self.dispatch(id, &settings, &params);
		}
	}

	fn dispatch(&mut self, id: TaskId, settings: &Settings, params: &AdaptiveParams) {
		let Some(task) = self.tasks.get_mut(&id) else {
			return;
		};

		self.next_dispatch += 1;
		let dispatch = self.next_dispatch;
		let invocation = build_invocation(task, settings, params);
		let reporter = Reporter::new(id, dispatch, self.exec_tx.clone());

		match self.executor.start(invocation, reporter) {
			Ok(handle) => {
				task.status = TaskStatus::Running;
				task.handle = Some(handle);
				task.dispatch = dispatch;
				task.attempts += 1;
				task.waiting_retry = false;
				task.started_at.get_or_insert_with(Utc::now);
				task.dispatched_at = Some(Instant::now());
				info!(task = %id, label = %task.label, attempt = task.attempts, "transfer started");

				if task.kind == TaskKind::Batch {
					self.next_batch_at = Some(Instant::now() + settings.inter_batch_delay());
				}
				self.running.insert(id);
			}
			Err(e) => {
				// No attempt took place, so there is nothing to retry.
				warn!(task = %id, label = %task.label, "{e}");
				self.finish(id, TaskStatus::Failed, TaskOutcome::failure(format!("could not start transfer: {e}")), 0);
			}
		}
	}

	fn on_event(&mut self, event: ExecEvent) {
		let Some(task) = self.tasks.get_mut(&event.task) else {
			return;
		};
		// Reports from cancelled or superseded attempts.
		if task.status != TaskStatus::Running || task.dispatch != event.dispatch {
			return;
		}

		match event.kind {
			ExecEventKind::Progress(line) => {
				if !line.trim().is_empty() {
					task.last_line = Some(line);
				}
			}
			ExecEventKind::Finished(report) => self.on_finished(event.task, report),
		}
	}

	fn on_finished(&mut self, id: TaskId, report: ExitReport) {
		self.running.remove(&id);
		let policy = self.settings.snapshot().retry_policy();

		let Some(task) = self.tasks.get_mut(&id) else {
			return;
		};
		task.handle = None;
		let elapsed = task.dispatched_at.map(|t| t.elapsed()).unwrap_or_default();
		let label = task.label.clone();
		let attempts = task.attempts;

		if report.success() {
			let bytes = report.bytes.filter(|b| *b > 0).unwrap_or(task.bytes);
			self.adaptive.observe(Observation::Transfer { bytes, elapsed, error: None });
			let outcome = TaskOutcome::success(format!("{label}: done")).with_output(report.output);
			self.finish(id, TaskStatus::Completed, outcome, bytes);
		} else {
			let class = ErrorClass::classify(report.code, &report.output);
			self.adaptive.observe(Observation::Transfer { bytes: 0, elapsed, error: Some(class) });

			match policy.decide(class, attempts) {
				RetryDecision::Retry(delay) => {
					task.status = TaskStatus::Pending;
					task.waiting_retry = true;
					info!(
						task = %id,
						label = %label,
						class = %class,
						attempt = attempts,
						delay_ms = delay.as_millis() as u64,
						"transfer failed, retrying"
					);
					self.schedule(delay, Timer::RetryDue(id));
				}
				RetryDecision::Exhausted => {
					let message =
						format!("{label}: max retries exceeded ({class}) after {attempts} attempts: {}", report.summary());
					self.finish(id, TaskStatus::Failed, TaskOutcome::failure(message).with_output(report.output), 0);
				}
				RetryDecision::NotRetryable => {
					let message = format!("{label}: not retryable ({class}): {}", report.summary());
					self.finish(id, TaskStatus::Failed, TaskOutcome::failure(message).with_output(report.output), 0);
				}
			}
		}

		self.admit();
	}

	fn on_timer(&mut self, timer: Timer) {
		match timer {
			Timer::RetryDue(id) => {
				let Some(task) = self.tasks.get_mut(&id) else {
					return;
				};
				if task.status != TaskStatus::Pending || !task.waiting_retry {
					return;
				}
				task.waiting_retry = false;
				// Original sequence number: a retry keeps its place in the tier.
				self.ready.insert((task.category, task.seq), id);
			}
			Timer::Wake => {
				if self.wake_at.is_some_and(|at| at <= Instant::now()) {
					self.wake_at = None;
				}
			}
		}
		self.admit();
	}

	fn schedule(&self, delay: Duration, timer: Timer) {
		let tx = self.timer_tx.clone();
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let _ = tx.send(timer);
		});
	}

	fn schedule_wake(&mut self, at: Instant) {
		if self.wake_at.is_some_and(|w| w <= at) {
			return;
		}
		self.wake_at = Some(at);
		self.schedule(at.saturating_duration_since(Instant::now()), Timer::Wake);
	}

	fn cancel(&mut self, id: TaskId) -> bool {
		let Some(task) = self.tasks.get_mut(&id) else {
			return false;
		};

		match task.status {
			TaskStatus::Pending => {
				self.ready.remove(&(task.category, task.seq));
			}
			TaskStatus::Running => {
				if let Some(mut handle) = task.handle.take() {
					if !handle.terminate() {
						debug!(task = %id, "executor already gone");
					}
				}
				self.running.remove(&id);
			}
			_ => return false,
		}

		info!(task = %id, "task cancelled");
		self.finish(id, TaskStatus::Cancelled, TaskOutcome::failure("cancelled"), 0);
		self.admit();
		true
	}

	/// Move a task to a terminal state: record it, notify whoever waits, retire it.
	fn finish(&mut self, id: TaskId, status: TaskStatus, outcome: TaskOutcome, bytes: u64) {
		let Some(task) = self.tasks.get_mut(&id) else {
			return;
		};
		if task.status.is_terminal() {
			return;
		}

		task.status = status;
		task.waiting_retry = false;
		task.handle = None;

		self.metrics.record(TransferRecord {
			task: id,
			label: task.label.clone(),
			paths: task.subject.paths().to_vec(),
			direction: task.direction,
			started_at: task.started_at,
			finished_at: Utc::now(),
			status,
			bytes,
			attempts: task.attempts,
		});

		match status {
			TaskStatus::Completed => info!(task = %id, label = %task.label, bytes, "transfer completed"),
			TaskStatus::Failed => warn!(task = %id, "{}", outcome.message),
			_ => {}
		}

		if let Some(tx) = task.continuation.take() {
			let _ = tx.send(outcome.clone());
		}
		for watcher in task.watchers.drain(..) {
			let _ = watcher.send(outcome.clone());
		}
		task.outcome = Some(outcome);

		self.terminal.push_back(id);
		while self.terminal.len() > RETAINED_TERMINAL {
			if let Some(old) = self.terminal.pop_front() {
				self.tasks.remove(&old);
			}
		}
	}

	fn status(&self) -> PoolStatus {
		let mut active: Vec<&TaskEntry> = self.tasks.values().filter(|t| !t.status.is_terminal()).collect();
		active.sort_by_key(|t| (t.status != TaskStatus::Running, t.category, t.seq));

		PoolStatus {
			metrics: PoolMetrics {
				pending: active.iter().filter(|t| t.status == TaskStatus::Pending).count(),
				running: self.running.len(),
				params: self.adaptive.params(),
				network: self.adaptive.stats().snapshot(),
				transfers: self.metrics.metrics(),
			},
			active: active.into_iter().map(TaskEntry::snapshot).collect(),
			recent: self.metrics.recent(STATUS_HISTORY),
		}
	}

	fn shutdown(&mut self) {
		self.closing = true;
		let open: Vec<TaskId> = self.tasks.values().filter(|t| !t.status.is_terminal()).map(|t| t.id).collect();
		if !open.is_empty() {
			info!(count = open.len(), "cancelling unfinished tasks");
		}
		for id in open {
			self.cancel(id);
		}
	}
}

fn with_slash(mut s: String) -> String {
	if !s.ends_with('/') {
		s.push('/');
	}
	s
}

fn build_invocation(task: &TaskEntry, settings: &Settings, params: &AdaptiveParams) -> Invocation {
	let (local, remote, files) = match (&task.kind, &task.subject) {
		(TaskKind::Batch, subject) => (
			with_slash(settings.transfer.local_root.display().to_string()),
			settings.remote_spec(Path::new("")),
			subject.paths().to_vec(),
		),
		(TaskKind::Directory, subject) => {
			let rel = subject.paths().first().cloned().unwrap_or_default();
			(
				with_slash(settings.local_path(&rel).display().to_string()),
				with_slash(settings.remote_spec(&rel)),
				Vec::new(),
			)
		}
		(TaskKind::SingleFile, subject) => {
			let rel = subject.paths().first().cloned().unwrap_or_default();
			(settings.local_path(&rel).display().to_string(), settings.remote_spec(&rel), Vec::new())
		}
	};

	let (source, destination) = match task.direction {
		Direction::Upload => (local, remote),
		Direction::Download => (remote, local),
	};

	Invocation {
		task: task.id,
		kind: task.kind,
		direction: task.direction,
		source,
		destination,
		files,
		options: TransferOptions::new(settings, params),
	}
}

/// Turn a multi-file request into queued units: config and large files alone,
/// the rest batched per category.
fn plan_tasks(direction: Direction, files: Vec<FileEntry>, batch_size: usize) -> Vec<NewTask> {
	let units = plan(files, batch_size);
	let batches = units.iter().filter(|u| matches!(u, Unit::Batch(_))).count();
	let mut n = 0;

	units
		.into_iter()
		.map(|unit| match unit {
			Unit::Single { category, file } => NewTask {
				kind: TaskKind::SingleFile,
				direction,
				label: file.path.display().to_string(),
				category,
				bytes: file.size,
				subject: Subject::Path(file.path),
				continuation: None,
			},
			Unit::Batch(batch) => {
				n += 1;
				NewTask {
					kind: TaskKind::Batch,
					direction,
					label: format!("batch {n}/{batches} ({} files, {})", batch.len(), batch.category),
					category: batch.category,
					bytes: batch.total_bytes(),
					subject: Subject::Paths(batch.paths()),
					continuation: None,
				}
			}
		})
		.collect()
}

/// Cheap, cloneable access to a running pool.
#[derive(Debug, Clone)]
pub struct PoolHandle {
	tx: mpsc::Sender<Command>,
	settings: SharedSettings,
}

impl PoolHandle {
	/// Start the scheduler on the current tokio runtime.
	pub fn spawn(settings: SharedSettings, executor: Arc<dyn TransferExecutor>) -> PoolHandle {
		let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
		let (exec_tx, events) = mpsc::unbounded_channel();
		let (timer_tx, timers) = mpsc::unbounded_channel();

		let baseline = settings.snapshot().baseline();
		let pool = TaskPool {
			settings: settings.clone(),
			executor,
			tasks: HashMap::new(),
			ready: BTreeMap::new(),
			running: HashSet::new(),
			terminal: VecDeque::new(),
			adaptive: AdaptiveController::new(&baseline),
			metrics: MetricsStore::default(),
			next_seq: 0,
			next_dispatch: 0,
			next_batch_at: None,
			wake_at: None,
			closing: false,
			exec_tx,
			timer_tx,
		};
		tokio::spawn(pool.run(commands, events, timers));

		PoolHandle { tx, settings }
	}

	pub fn settings(&self) -> &SharedSettings {
		&self.settings
	}

	async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SubmitError> {
		let (reply, rx) = oneshot::channel();
		self.tx.send(make(reply)).await.map_err(|_| SubmitError::PoolClosed)?;
		rx.await.map_err(|_| SubmitError::PoolClosed)
	}

	/// Validate and enqueue. Returns as soon as the task is queued.
	pub async fn submit(&self, request: TaskRequest) -> Result<TaskId, SubmitError> {
		self.enqueue(request, None).await
	}

	/// Like [`submit`](Self::submit), with a completion notification.
	pub async fn submit_with(
		&self,
		request: TaskRequest,
		continuation: oneshot::Sender<TaskOutcome>,
	) -> Result<TaskId, SubmitError> {
		self.enqueue(request, Some(continuation)).await
	}

	async fn enqueue(
		&self,
		request: TaskRequest,
		continuation: Option<oneshot::Sender<TaskOutcome>>,
	) -> Result<TaskId, SubmitError> {
		let mut task = self.prepare(request).await?;
		task.continuation = continuation;
		let ids = self.request(|reply| Command::Submit { tasks: vec![task], reply }).await?;
		ids.into_iter().next().ok_or(SubmitError::PoolClosed)
	}

	async fn prepare(&self, request: TaskRequest) -> Result<NewTask, SubmitError> {
		request.validate()?;
		let settings = self.settings.snapshot();
		let root = settings.transfer.local_root.clone();
		let upload = request.direction == Direction::Upload;

		let mut files = Vec::with_capacity(request.subject.len());
		for path in request.subject.paths() {
			let rel = relative_to(&root, path)?;
			match request.kind {
				TaskKind::Directory => {
					if upload {
						let meta = stat(&settings, &rel).await?;
						if !meta.is_dir() {
							return Err(SubmitError::Validation(format!("{} is not a directory", rel.display())));
						}
					}
					files.push(FileEntry::new(rel, 0));
				}
				TaskKind::SingleFile | TaskKind::Batch => {
					let size = if upload { file_size(&settings, &rel).await? } else { 0 };
					files.push(FileEntry::new(rel, size));
				}
			}
		}

		let bytes = files.iter().map(|f| f.size).sum();
		let (category, label, subject) = match request.kind {
			TaskKind::Directory => {
				let rel = files.remove(0).path;
				(Category::Large, format!("{}/", rel.display()), Subject::Path(rel))
			}
			TaskKind::SingleFile => {
				let file = files.remove(0);
				(classify(&file.path, file.size), file.path.display().to_string(), Subject::Path(file.path))
			}
			TaskKind::Batch => {
				// A mixed batch waits with its lowest-priority member.
				let category = files.iter().map(|f| classify(&f.path, f.size)).max().unwrap_or(Category::Small);
				let label = format!("batch ({} files, {category})", files.len());
				(category, label, Subject::Paths(files.into_iter().map(|f| f.path).collect()))
			}
		};

		Ok(NewTask { kind: request.kind, direction: request.direction, subject, category, bytes, label, continuation: None })
	}

	/// Multi-file entry point: classify, batch with the current batch size,
	/// and queue everything. Ids come back in admission order.
	pub async fn submit_files(&self, direction: Direction, paths: Vec<PathBuf>) -> Result<Vec<TaskId>, SubmitError> {
		if paths.is_empty() {
			return Err(SubmitError::Validation("no files given".into()));
		}
		let settings = self.settings.snapshot();

		let mut files = Vec::with_capacity(paths.len());
		for path in &paths {
			if path.as_os_str().is_empty() {
				return Err(SubmitError::Validation("empty path".into()));
			}
			let rel = relative_to(&settings.transfer.local_root, path)?;
			let size = if direction == Direction::Upload { file_size(&settings, &rel).await? } else { 0 };
			files.push(FileEntry::new(rel, size));
		}

		self.request(|reply| Command::SubmitFiles { direction, files, reply }).await
	}

	/// Upload everything under the local root that passes the filters.
	pub async fn sync_all(&self) -> Result<SyncReport, SyncError> {
		let settings = self.settings.snapshot();
		let scan = tokio::task::spawn_blocking(move || scanner::scan(&settings))
			.await
			.map_err(|e| ScanError::Join(e.to_string()))??;

		info!(files = scan.files.len(), bytes = scan.total_bytes, excluded = scan.excluded, "scan complete");
		if scan.files.is_empty() {
			return Ok(SyncReport { scan, tasks: Vec::new() });
		}

		let files = scan.files.clone();
		let tasks = self.request(|reply| Command::SubmitFiles { direction: Direction::Upload, files, reply }).await?;
		Ok(SyncReport { scan, tasks })
	}

	/// Submit and block until the task finishes or `timeout` elapses. On
	/// timeout the task is cancelled and the caller gets a "timeout" failure,
	/// whatever the executor does afterwards.
	pub async fn submit_and_wait(&self, request: TaskRequest, timeout: Duration) -> Result<TaskOutcome, SubmitError> {
		let (tx, rx) = oneshot::channel();
		let id = self.submit_with(request, tx).await?;
		self.await_outcome(id, rx, timeout).await
	}

	/// Wait on a task that is already queued, running, or recently finished.
	pub async fn wait_for(&self, id: TaskId, timeout: Duration) -> Result<TaskOutcome, SubmitError> {
		let (watcher, rx) = oneshot::channel();
		let known = self.request(|reply| Command::Watch { id, watcher, reply }).await?;
		if !known {
			return Err(SubmitError::NotFound(format!("task {id}")));
		}
		self.await_outcome(id, rx, timeout).await
	}

	async fn await_outcome(
		&self,
		id: TaskId,
		rx: oneshot::Receiver<TaskOutcome>,
		timeout: Duration,
	) -> Result<TaskOutcome, SubmitError> {
		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(outcome)) => Ok(outcome),
			Ok(Err(_)) => Err(SubmitError::PoolClosed),
			Err(_) => {
				debug!(task = %id, timeout_ms = timeout.as_millis() as u64, "wait timed out");
				self.cancel(id).await?;
				Ok(TaskOutcome::timeout())
			}
		}
	}

	/// Returns false when the task is unknown or already terminal.
	pub async fn cancel(&self, id: TaskId) -> Result<bool, SubmitError> {
		self.request(|reply| Command::Cancel { id, reply }).await
	}

	pub async fn status(&self) -> Result<PoolStatus, SubmitError> {
		self.request(|reply| Command::Status { reply }).await
	}

	pub async fn observe(&self, observation: Observation) -> Result<(), SubmitError> {
		self.tx.send(Command::Observe(observation)).await.map_err(|_| SubmitError::PoolClosed)
	}

	/// Cancel whatever is left and stop the scheduler.
	pub async fn shutdown(&self) -> Result<(), SubmitError> {
		self.request(|reply| Command::Shutdown { reply }).await
	}
}

async fn stat(settings: &Settings, rel: &Path) -> Result<std::fs::Metadata, SubmitError> {
	let path = settings.local_path(rel);
	tokio::fs::metadata(&path).await.map_err(|e| match e.kind() {
		std::io::ErrorKind::NotFound => SubmitError::NotFound(path.display().to_string()),
		_ => SubmitError::Validation(format!("{}: {e}", path.display())),
	})
}

async fn file_size(settings: &Settings, rel: &Path) -> Result<u64, SubmitError> {
	let meta = stat(settings, rel).await?;
	if meta.is_dir() {
		return Err(SubmitError::Validation(format!("{} is a directory", rel.display())));
	}
	let limit = settings.transfer.max_file_size;
	if meta.len() > limit {
		return Err(SubmitError::SizeExceeded { path: rel.display().to_string(), size: meta.len(), limit });
	}
	Ok(meta.len())
}

#[cfg(test)]
mod tests {
	use relay_core::classify::MIB;

	use super::*;

	fn settings() -> Settings {
		let mut settings = Settings::default();
		settings.remote.host = "example.com".into();
		settings.remote.user = Some("deploy".into());
		settings.remote.path = "/srv/app".into();
		settings.transfer.local_root = PathBuf::from("/home/me/project");
		settings
	}

	fn entry(kind: TaskKind, direction: Direction, subject: Subject) -> TaskEntry {
		TaskEntry {
			id: TaskId::new(),
			kind,
			direction,
			subject,
			category: Category::Small,
			label: String::new(),
			bytes: 0,
			seq: 1,
			status: TaskStatus::Pending,
			attempts: 0,
			waiting_retry: false,
			dispatch: 0,
			handle: None,
			created_at: Utc::now(),
			started_at: None,
			dispatched_at: None,
			last_line: None,
			outcome: None,
			continuation: None,
			watchers: Vec::new(),
		}
	}

	#[test]
	fn single_upload_invocation() {
		let s = settings();
		let params = AdaptiveParams::from_baseline(&s.baseline());
		let task = entry(TaskKind::SingleFile, Direction::Upload, Subject::Path("src/main.rs".into()));

		let inv = build_invocation(&task, &s, &params);
		assert_eq!(inv.source, "/home/me/project/src/main.rs");
		assert_eq!(inv.destination, "deploy@example.com:/srv/app/src/main.rs");
		assert!(inv.files.is_empty());
	}

	#[test]
	fn directory_download_uses_trailing_slashes() {
		let s = settings();
		let params = AdaptiveParams::from_baseline(&s.baseline());
		let task = entry(TaskKind::Directory, Direction::Download, Subject::Path("assets".into()));

		let inv = build_invocation(&task, &s, &params);
		assert_eq!(inv.source, "deploy@example.com:/srv/app/assets/");
		assert_eq!(inv.destination, "/home/me/project/assets/");
	}

	#[test]
	fn batch_invocation_moves_roots_with_file_list() {
		let s = settings();
		let params = AdaptiveParams::from_baseline(&s.baseline());
		let task = entry(TaskKind::Batch, Direction::Upload, Subject::Paths(vec!["a.txt".into(), "b/c.txt".into()]));

		let inv = build_invocation(&task, &s, &params);
		assert_eq!(inv.source, "/home/me/project/");
		assert_eq!(inv.destination, "deploy@example.com:/srv/app/");
		assert_eq!(inv.files, vec![PathBuf::from("a.txt"), PathBuf::from("b/c.txt")]);
	}

	#[test]
	fn planned_tasks_are_labelled_in_tier_order() {
		let files = vec![
			FileEntry::new("big.sql", 20 * MIB),
			FileEntry::new("a.txt", 10),
			FileEntry::new("Cargo.toml", 200),
			FileEntry::new("b.txt", 10),
			FileEntry::new("c.txt", 10),
		];

		let tasks = plan_tasks(Direction::Upload, files, 2);
		let labels: Vec<&str> = tasks.iter().map(|t| t.label.as_str()).collect();
		assert_eq!(labels, vec!["Cargo.toml", "batch 1/2 (2 files, small)", "batch 2/2 (1 files, small)", "big.sql"]);
		assert_eq!(tasks[1].bytes, 20);
		assert_eq!(tasks[3].category, Category::Large);
	}
}
