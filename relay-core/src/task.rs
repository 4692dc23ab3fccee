use std::{
	fmt,
	path::{Path, PathBuf},
	str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::classify::Category;

/// Opaque task identifier, assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Ulid);

impl TaskId {
	pub fn new() -> Self {
		TaskId(Ulid::new())
	}
}

impl Default for TaskId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for TaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

impl FromStr for TaskId {
	type Err = ulid::DecodeError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ulid::from_string(s).map(TaskId)
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
	SingleFile,
	Directory,
	Batch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
	Upload,
	Download,
}

impl fmt::Display for Direction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Direction::Upload => f.write_str("upload"),
			Direction::Download => f.write_str("download"),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
	Pending,
	Running,
	Completed,
	Failed,
	Cancelled,
}

impl TaskStatus {
	/// Terminal states never transition further.
	pub fn is_terminal(self) -> bool {
		matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
	}
}

impl fmt::Display for TaskStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			TaskStatus::Pending => "pending",
			TaskStatus::Running => "running",
			TaskStatus::Completed => "completed",
			TaskStatus::Failed => "failed",
			TaskStatus::Cancelled => "cancelled",
		};
		f.write_str(s)
	}
}

/// What a task moves. Paths are relative to the configured local root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
	Path(PathBuf),
	Paths(Vec<PathBuf>),
}

impl Subject {
	pub fn paths(&self) -> &[PathBuf] {
		match self {
			Subject::Path(p) => std::slice::from_ref(p),
			Subject::Paths(ps) => ps,
		}
	}

	pub fn len(&self) -> usize {
		self.paths().len()
	}

	pub fn is_empty(&self) -> bool {
		self.paths().is_empty()
	}
}

/// A caller's transfer request before it is validated and queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
	pub kind: TaskKind,
	pub direction: Direction,
	pub subject: Subject,
}

impl TaskRequest {
	pub fn single(direction: Direction, path: impl Into<PathBuf>) -> Self {
		TaskRequest { kind: TaskKind::SingleFile, direction, subject: Subject::Path(path.into()) }
	}

	pub fn directory(direction: Direction, path: impl Into<PathBuf>) -> Self {
		TaskRequest { kind: TaskKind::Directory, direction, subject: Subject::Path(path.into()) }
	}

	pub fn batch(direction: Direction, paths: Vec<PathBuf>) -> Self {
		TaskRequest { kind: TaskKind::Batch, direction, subject: Subject::Paths(paths) }
	}

	/// Shape checks that need no filesystem access.
	pub fn validate(&self) -> Result<(), SubmitError> {
		match (&self.kind, &self.subject) {
			(TaskKind::Batch, Subject::Paths(paths)) if paths.is_empty() => {
				Err(SubmitError::Validation("batch has no files".into()))
			}
			(TaskKind::Batch, Subject::Paths(_)) => Ok(()),
			(TaskKind::Batch, Subject::Path(_)) => Err(SubmitError::Validation("batch needs a path list".into())),
			(_, Subject::Path(_)) => Ok(()),
			(kind, Subject::Paths(_)) => Err(SubmitError::Validation(format!("{kind:?} takes exactly one path"))),
		}?;

		for path in self.subject.paths() {
			if path.as_os_str().is_empty() {
				return Err(SubmitError::Validation("empty path".into()));
			}
		}
		Ok(())
	}
}

/// Result carried by a task once it is terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskOutcome {
	pub success: bool,
	pub message: String,
	/// Tail of the executor's output, when it produced any.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub output: Vec<String>,
}

impl TaskOutcome {
	pub fn success(message: impl Into<String>) -> Self {
		TaskOutcome { success: true, message: message.into(), output: Vec::new() }
	}

	pub fn failure(message: impl Into<String>) -> Self {
		TaskOutcome { success: false, message: message.into(), output: Vec::new() }
	}

	pub fn timeout() -> Self {
		Self::failure("timeout")
	}

	pub fn with_output(mut self, output: Vec<String>) -> Self {
		self.output = output;
		self
	}
}

/// Read-only view of a queued or running task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
	pub id: TaskId,
	pub kind: TaskKind,
	pub direction: Direction,
	pub category: Category,
	pub label: String,
	pub file_count: usize,
	pub status: TaskStatus,
	pub attempts: u32,
	pub waiting_retry: bool,
	pub created_at: DateTime<Utc>,
	pub started_at: Option<DateTime<Utc>>,
	pub last_line: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
	#[error("invalid request: {0}")]
	Validation(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("{path} is {size} bytes, above the {limit} byte limit")]
	SizeExceeded { path: String, size: u64, limit: u64 },

	#[error("task pool is shut down")]
	PoolClosed,
}

/// Turn a caller path into one relative to `root`, rejecting anything that escapes it.
pub fn relative_to(root: &Path, path: &Path) -> Result<PathBuf, SubmitError> {
	let rel = if path.is_absolute() {
		path.strip_prefix(root)
			.map_err(|_| SubmitError::Validation(format!("{} is outside {}", path.display(), root.display())))?
			.to_path_buf()
	} else {
		path.to_path_buf()
	};

	let mut clean = PathBuf::new();
	for component in rel.components() {
		match component {
			std::path::Component::Normal(c) => clean.push(c),
			std::path::Component::CurDir => {}
			_ => {
				return Err(SubmitError::Validation(format!("{} escapes the local root", path.display())));
			}
		}
	}
	Ok(clean)
}
