use std::{process::Stdio, time::Duration};

use relay_core::{Observation, Settings, SharedSettings};
use thiserror::Error;
use tokio::{process::Command, task::JoinHandle, time::Instant};
use tracing::{debug, warn};

use crate::pool::PoolHandle;

#[derive(Debug, Error)]
pub enum ProbeError {
	#[error("failed to run ssh: {0}")]
	Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSample {
	pub reachable: bool,
	/// Time for a full no-op ssh round trip, when it succeeded.
	pub rtt: Option<Duration>,
}

impl From<ProbeSample> for Observation {
	fn from(sample: ProbeSample) -> Self {
		Observation::Probe { reachable: sample.reachable, rtt: sample.rtt }
	}
}

pub fn probe_args(settings: &Settings) -> Vec<String> {
	let mut args = vec![
		"-o".to_string(),
		"BatchMode=yes".to_string(),
		"-o".to_string(),
		format!("ConnectTimeout={}", settings.probe.connect_timeout_secs.max(1)),
		"-p".to_string(),
		settings.remote.port.to_string(),
	];
	if let Some(identity) = &settings.remote.identity_file {
		args.push("-i".into());
		args.push(identity.display().to_string());
	}
	args.push(settings.ssh_target());
	args.push("true".into());
	args
}

/// One `ssh host true` round trip.
pub async fn probe(settings: &Settings) -> Result<ProbeSample, ProbeError> {
	let limit = Duration::from_secs(settings.probe.connect_timeout_secs.max(1) * 2);
	let started = Instant::now();

	let output = tokio::time::timeout(
		limit,
		Command::new("ssh")
			.args(probe_args(settings))
			.stdin(Stdio::null())
			.kill_on_drop(true)
			.output(),
	)
	.await;

	let output = match output {
		Ok(result) => result?,
		Err(_) => {
			debug!(host = %settings.remote.host, "probe timed out");
			return Ok(ProbeSample { reachable: false, rtt: None });
		}
	};

	if output.status.success() {
		Ok(ProbeSample { reachable: true, rtt: Some(started.elapsed()) })
	} else {
		debug!(host = %settings.remote.host, code = ?output.status.code(), "probe failed");
		Ok(ProbeSample { reachable: false, rtt: None })
	}
}

/// Probes the remote on an interval and feeds the results to the pool.
pub struct ProbeWatcher {
	handle: JoinHandle<()>,
}

impl ProbeWatcher {
	pub fn start(pool: PoolHandle, settings: SharedSettings) -> Self {
		let handle = tokio::spawn(async move {
			loop {
				let current = settings.snapshot();
				match probe(&current).await {
					Ok(sample) => {
						if pool.observe(sample.into()).await.is_err() {
							break;
						}
					}
					Err(e) => warn!("probe error: {e}"),
				}
				let interval = Duration::from_secs(current.probe.interval_secs.max(1));
				tokio::time::sleep(interval).await;
			}
		});
		ProbeWatcher { handle }
	}

	pub fn stop(self) {
		self.handle.abort();
	}
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use super::*;

	#[test]
	fn args_target_the_configured_host() {
		let mut settings = Settings::default();
		settings.remote.host = "example.com".into();
		settings.remote.user = Some("deploy".into());
		settings.remote.port = 2200;
		settings.remote.identity_file = Some(PathBuf::from("/keys/id"));

		let args = probe_args(&settings);
		assert_eq!(
			args,
			vec!["-o", "BatchMode=yes", "-o", "ConnectTimeout=5", "-p", "2200", "-i", "/keys/id", "deploy@example.com", "true"]
		);
	}

	#[test]
	fn sample_becomes_observation() {
		let obs: Observation = ProbeSample { reachable: true, rtt: Some(Duration::from_millis(40)) }.into();
		assert_eq!(obs, Observation::Probe { reachable: true, rtt: Some(Duration::from_millis(40)) });
	}
}
