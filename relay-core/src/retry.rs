use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

pub const TIMEOUT_MAX_ATTEMPTS: u32 = 3;
pub const NETWORK_MAX_ATTEMPTS: u32 = 5;
pub const OTHER_MAX_ATTEMPTS: u32 = 2;

const DEFAULT_TIMEOUT_BASE: Duration = Duration::from_secs(2);
const DEFAULT_NETWORK_BASE: Duration = Duration::from_secs(5);
const DEFAULT_OTHER_DELAY: Duration = Duration::from_secs(1);

/// Failure class of a finished executor invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
	Timeout,
	Network,
	DiskFull,
	Other,
}

impl ErrorClass {
	pub fn as_str(self) -> &'static str {
		match self {
			ErrorClass::Timeout => "timeout",
			ErrorClass::Network => "network",
			ErrorClass::DiskFull => "disk_full",
			ErrorClass::Other => "other",
		}
	}

	/// Classify from the exit code and output of an rsync-style tool.
	/// Disk-full text is checked first since it can accompany any exit code.
	pub fn classify(exit_code: Option<i32>, output: &[String]) -> Self {
		let lowered: Vec<String> = output.iter().map(|l| l.to_ascii_lowercase()).collect();
		let mentions = |needles: &[&str]| lowered.iter().any(|l| needles.iter().any(|n| l.contains(n)));

		if mentions(DISK_FULL_TEXT) {
			return ErrorClass::DiskFull;
		}
		match exit_code {
			Some(30) | Some(35) => return ErrorClass::Timeout,
			Some(10) | Some(12) | Some(255) => return ErrorClass::Network,
			_ => {}
		}
		if mentions(TIMEOUT_TEXT) {
			ErrorClass::Timeout
		} else if mentions(NETWORK_TEXT) {
			ErrorClass::Network
		} else {
			ErrorClass::Other
		}
	}
}

impl fmt::Display for ErrorClass {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

const DISK_FULL_TEXT: &[&str] = &["no space left on device", "disk full", "disk quota exceeded", "quota exceeded"];

const TIMEOUT_TEXT: &[&str] = &["timed out", "timeout"];

const NETWORK_TEXT: &[&str] = &[
	"connection refused",
	"connection reset",
	"connection unexpectedly closed",
	"connection closed",
	"could not resolve hostname",
	"network is unreachable",
	"no route to host",
	"broken pipe",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
	Retry(Duration),
	/// The class allows retries but the attempt budget is spent.
	Exhausted,
	NotRetryable,
}

impl RetryDecision {
	pub fn should_retry(self) -> bool {
		matches!(self, RetryDecision::Retry(_))
	}

	pub fn delay(self) -> Option<Duration> {
		match self {
			RetryDecision::Retry(d) => Some(d),
			_ => None,
		}
	}
}

/// Maps a failure class and attempt count to a retry verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	pub timeout_base: Duration,
	pub network_base: Duration,
	pub other_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		RetryPolicy {
			timeout_base: DEFAULT_TIMEOUT_BASE,
			network_base: DEFAULT_NETWORK_BASE,
			other_delay: DEFAULT_OTHER_DELAY,
		}
	}
}

impl RetryPolicy {
	pub fn max_attempts(class: ErrorClass) -> u32 {
		match class {
			ErrorClass::Timeout => TIMEOUT_MAX_ATTEMPTS,
			ErrorClass::Network => NETWORK_MAX_ATTEMPTS,
			ErrorClass::DiskFull => 1,
			ErrorClass::Other => OTHER_MAX_ATTEMPTS,
		}
	}

	/// `attempt` is the number of attempts already made, starting at 1.
	pub fn decide(&self, class: ErrorClass, attempt: u32) -> RetryDecision {
		if class == ErrorClass::DiskFull {
			return RetryDecision::NotRetryable;
		}
		if attempt >= Self::max_attempts(class) {
			return RetryDecision::Exhausted;
		}

		let attempt = attempt.max(1);
		let delay = match class {
			ErrorClass::Timeout => self.timeout_base.saturating_mul(attempt),
			ErrorClass::Network => self.network_base.saturating_mul(attempt),
			_ => self.other_delay,
		};
		RetryDecision::Retry(delay)
	}
}
