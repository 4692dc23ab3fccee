use std::{collections::VecDeque, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Direction, TaskId, TaskStatus};

pub const DEFAULT_HISTORY: usize = 1000;

/// One finished task. Written once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRecord {
	pub task: TaskId,
	pub label: String,
	pub paths: Vec<PathBuf>,
	pub direction: Direction,
	pub started_at: Option<DateTime<Utc>>,
	pub finished_at: DateTime<Utc>,
	pub status: TaskStatus,
	pub bytes: u64,
	pub attempts: u32,
}

impl TransferRecord {
	/// Wall time from first dispatch to the terminal state.
	pub fn duration(&self) -> Option<chrono::Duration> {
		self.started_at.map(|s| self.finished_at - s)
	}
}

/// Aggregates over everything recorded so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransferMetrics {
	pub total: u64,
	pub completed: u64,
	pub failed: u64,
	pub cancelled: u64,
	pub bytes_transferred: u64,
	/// completed / (completed + failed); `None` until something finished.
	pub success_rate: Option<f64>,
	/// Bytes per second over completed transfers still in the history window.
	pub average_speed: Option<f64>,
}

/// Bounded history of finished transfers plus running totals.
#[derive(Debug, Clone)]
pub struct MetricsStore {
	history: VecDeque<TransferRecord>,
	capacity: usize,
	completed: u64,
	failed: u64,
	cancelled: u64,
	bytes: u64,
}

impl Default for MetricsStore {
	fn default() -> Self {
		Self::with_capacity(DEFAULT_HISTORY)
	}
}

impl MetricsStore {
	pub fn with_capacity(capacity: usize) -> Self {
		MetricsStore {
			history: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY)),
			capacity: capacity.max(1),
			completed: 0,
			failed: 0,
			cancelled: 0,
			bytes: 0,
		}
	}

	pub fn record(&mut self, record: TransferRecord) {
		match record.status {
			TaskStatus::Completed => {
				self.completed += 1;
				self.bytes = self.bytes.saturating_add(record.bytes);
			}
			TaskStatus::Failed => self.failed += 1,
			TaskStatus::Cancelled => self.cancelled += 1,
			TaskStatus::Pending | TaskStatus::Running => {
				tracing::warn!(task = %record.task, status = %record.status, "ignoring non-terminal transfer record");
				return;
			}
		}

		if self.history.len() == self.capacity {
			self.history.pop_front();
		}
		self.history.push_back(record);
	}

	pub fn metrics(&self) -> TransferMetrics {
		let decided = self.completed + self.failed;
		let success_rate = (decided > 0).then(|| self.completed as f64 / decided as f64);

		let (bytes, secs) = self
			.history
			.iter()
			.filter(|r| r.status == TaskStatus::Completed)
			.filter_map(|r| r.duration().map(|d| (r.bytes, d.num_milliseconds().max(0) as f64 / 1000.0)))
			.fold((0u64, 0f64), |(b, s), (rb, rs)| (b + rb, s + rs));
		let average_speed = (secs > 0.0).then(|| bytes as f64 / secs);

		TransferMetrics {
			total: self.completed + self.failed + self.cancelled,
			completed: self.completed,
			failed: self.failed,
			cancelled: self.cancelled,
			bytes_transferred: self.bytes,
			success_rate,
			average_speed,
		}
	}

	pub fn history(&self) -> impl Iterator<Item = &TransferRecord> {
		self.history.iter()
	}

	/// Most recent records, newest last.
	pub fn recent(&self, n: usize) -> Vec<TransferRecord> {
		let skip = self.history.len().saturating_sub(n);
		self.history.iter().skip(skip).cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.history.len()
	}

	pub fn is_empty(&self) -> bool {
		self.history.is_empty()
	}
}
