use std::{collections::VecDeque, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::retry::ErrorClass;

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;

const FAST_LATENCY: Duration = Duration::from_millis(50);
const SLOW_LATENCY: Duration = Duration::from_millis(300);
const LOSS_THRESHOLD: f64 = 0.05;
const LOSS_WINDOW: usize = 20;

/// Operator-configured starting point the controller adapts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Baseline {
	pub max_concurrency: usize,
	pub batch_size: usize,
	pub timeout: Duration,
	pub compression: bool,
}

/// Parameters in force for the next admission or batch formation.
/// Running tasks keep whatever they were started with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdaptiveParams {
	pub max_concurrency: usize,
	pub compression_enabled: bool,
	#[serde(with = "duration_secs")]
	pub timeout: Duration,
	pub batch_size: usize,
}

impl AdaptiveParams {
	pub fn from_baseline(baseline: &Baseline) -> Self {
		AdaptiveParams {
			max_concurrency: baseline.max_concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY),
			compression_enabled: baseline.compression,
			timeout: baseline.timeout,
			batch_size: baseline.batch_size.max(1),
		}
	}

	pub fn derive(stats: &NetworkStats, baseline: &Baseline) -> Self {
		let mut params = Self::from_baseline(baseline);

		if let Some(latency) = stats.latency() {
			if latency < FAST_LATENCY {
				params.max_concurrency = baseline.max_concurrency.saturating_mul(2);
			} else if latency > SLOW_LATENCY {
				params.compression_enabled = true;
				params.timeout = baseline.timeout.saturating_mul(2);
				params.batch_size = (baseline.batch_size / 2).max(1);
			}
		}

		if stats.packet_loss() > LOSS_THRESHOLD {
			params.max_concurrency = 1;
			params.timeout = params.timeout.max(baseline.timeout.saturating_mul(3));
		}

		params.max_concurrency = params.max_concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
		params
	}
}

/// Rolling estimates of link quality.
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
	latency: Option<Duration>,
	bandwidth: Option<f64>,
	samples: VecDeque<bool>,
}

impl NetworkStats {
	pub fn latency(&self) -> Option<Duration> {
		self.latency
	}

	/// Bytes per second.
	pub fn bandwidth(&self) -> Option<f64> {
		self.bandwidth
	}

	/// Failure fraction over the recent connectivity samples.
	pub fn packet_loss(&self) -> f64 {
		if self.samples.is_empty() {
			return 0.0;
		}
		let lost = self.samples.iter().filter(|ok| !**ok).count();
		lost as f64 / self.samples.len() as f64
	}

	/// SRTT-style smoothing: 7/8 old, 1/8 new.
	pub fn record_latency(&mut self, sample: Duration) {
		self.latency = Some(match self.latency {
			Some(old) => {
				let nanos = (old.as_nanos() as u64).saturating_mul(7).saturating_add(sample.as_nanos() as u64) / 8;
				Duration::from_nanos(nanos)
			}
			None => sample,
		});
	}

	pub fn record_throughput(&mut self, bytes: u64, elapsed: Duration) {
		if bytes == 0 || elapsed.is_zero() {
			return;
		}
		let rate = bytes as f64 / elapsed.as_secs_f64();
		self.bandwidth = Some(match self.bandwidth {
			Some(old) => old * 0.875 + rate * 0.125,
			None => rate,
		});
	}

	pub fn record_connectivity(&mut self, ok: bool) {
		if self.samples.len() == LOSS_WINDOW {
			self.samples.pop_front();
		}
		self.samples.push_back(ok);
	}

	pub fn snapshot(&self) -> NetworkSnapshot {
		NetworkSnapshot {
			latency_ms: self.latency.map(|d| d.as_millis() as u64),
			bandwidth: self.bandwidth,
			packet_loss: self.packet_loss(),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NetworkSnapshot {
	pub latency_ms: Option<u64>,
	pub bandwidth: Option<f64>,
	pub packet_loss: f64,
}

/// Something the controller learns from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
	Probe { reachable: bool, rtt: Option<Duration> },
	Transfer { bytes: u64, elapsed: Duration, error: Option<ErrorClass> },
}

/// Owns the network estimates and the parameters derived from them.
#[derive(Debug, Clone)]
pub struct AdaptiveController {
	stats: NetworkStats,
	params: AdaptiveParams,
}

impl AdaptiveController {
	pub fn new(baseline: &Baseline) -> Self {
		AdaptiveController { stats: NetworkStats::default(), params: AdaptiveParams::from_baseline(baseline) }
	}

	pub fn observe(&mut self, observation: Observation) {
		match observation {
			Observation::Probe { reachable, rtt } => {
				self.stats.record_connectivity(reachable);
				if let Some(rtt) = rtt.filter(|_| reachable) {
					self.stats.record_latency(rtt);
				}
			}
			Observation::Transfer { bytes, elapsed, error: None } => {
				self.stats.record_connectivity(true);
				self.stats.record_throughput(bytes, elapsed);
			}
			Observation::Transfer { error: Some(ErrorClass::Network), .. } => {
				self.stats.record_connectivity(false);
			}
			// timeouts and tool errors say nothing reliable about the link
			Observation::Transfer { .. } => {}
		}
	}

	/// Recompute from the current estimates and a fresh baseline.
	pub fn refresh(&mut self, baseline: &Baseline) -> AdaptiveParams {
		let next = AdaptiveParams::derive(&self.stats, baseline);
		if next != self.params {
			info!(
				max_concurrency = next.max_concurrency,
				compression = next.compression_enabled,
				timeout_secs = next.timeout.as_secs(),
				batch_size = next.batch_size,
				"transfer parameters adjusted"
			);
			self.params = next;
		}
		self.params
	}

	pub fn params(&self) -> AdaptiveParams {
		self.params
	}

	pub fn stats(&self) -> &NetworkStats {
		&self.stats
	}
}

mod duration_secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(value.as_secs())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_secs)
	}
}
