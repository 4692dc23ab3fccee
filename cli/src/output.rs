use std::{path::Path, time::Duration};

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use relay_core::{AdaptiveParams, TaskOutcome, TaskStatus, TransferMetrics};
use relay_daemon::{PoolHandle, PoolStatus, ProbeSample, ScanResult};
use serde::Serialize;
use tokio::task::JoinHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const LAST_LINE_WIDTH: usize = 60;

/// Spinner fed by periodic status snapshots from the pool.
pub struct Progress {
	bar: ProgressBar,
	poller: JoinHandle<()>,
}

impl Progress {
	pub fn start(pool: PoolHandle, total: usize, hidden: bool) -> Self {
		let bar = if hidden { ProgressBar::hidden() } else { ProgressBar::new_spinner() };
		bar.set_style(
			ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
				.unwrap_or_else(|_| ProgressStyle::default_spinner())
				.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
		);
		bar.enable_steady_tick(Duration::from_millis(100));
		bar.set_message(format!("0/{total} done"));

		let ticker = bar.clone();
		let poller = tokio::spawn(async move {
			while let Ok(status) = pool.status().await {
				ticker.set_message(describe(&status, total));
				tokio::time::sleep(POLL_INTERVAL).await;
			}
		});

		Progress { bar, poller }
	}

	pub fn finish(&self) {
		self.poller.abort();
		self.bar.finish_and_clear();
	}

	pub fn abandon(&self, message: &'static str) {
		self.poller.abort();
		self.bar.abandon_with_message(message);
	}
}

fn describe(status: &PoolStatus, total: usize) -> String {
	let m = &status.metrics;
	let mut message = format!("{}/{total} done, {} running, {} queued", m.transfers.total, m.running, m.pending);

	let current = status.active.iter().find(|t| t.status == TaskStatus::Running);
	if let Some(task) = current {
		let line = task.last_line.as_deref().unwrap_or(&task.label);
		message.push_str(&format!("  {}", style(truncate(line, LAST_LINE_WIDTH)).dim()));
	}
	message
}

fn truncate(s: &str, width: usize) -> String {
	if s.chars().count() <= width {
		s.to_string()
	} else {
		let head: String = s.chars().take(width.saturating_sub(1)).collect();
		format!("{head}…")
	}
}

pub fn format_bytes(bytes: u64) -> String {
	if bytes < 1024 {
		format!("{bytes} B")
	} else if bytes < 1024 * 1024 {
		format!("{:.1} KB", bytes as f64 / 1024.0)
	} else if bytes < 1024 * 1024 * 1024 {
		format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
	} else {
		format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
	}
}

pub fn print_scan(root: &Path, scan: &ScanResult) {
	println!(
		"{} {} files ({}) under {}",
		style("scan").cyan(),
		scan.files.len(),
		format_bytes(scan.total_bytes),
		root.display()
	);
	if scan.excluded + scan.skipped + scan.oversized > 0 {
		println!(
			"     {}",
			style(format!("{} excluded, {} skipped, {} over the size limit", scan.excluded, scan.skipped, scan.oversized))
				.dim()
		);
	}
}

pub fn print_summary(outcomes: &[TaskOutcome], metrics: &TransferMetrics) {
	for outcome in outcomes {
		if outcome.success {
			println!("  {} {}", style("✓").green(), outcome.message);
		} else {
			println!("  {} {}", style("✗").red(), outcome.message);
			let tail = outcome.output.len().saturating_sub(3);
			for line in &outcome.output[tail..] {
				println!("      {}", style(line).dim());
			}
		}
	}

	println!();
	let mut line = format!(
		"{} completed, {} failed, {} cancelled, {} moved",
		style(metrics.completed).green(),
		style(metrics.failed).red(),
		metrics.cancelled,
		format_bytes(metrics.bytes_transferred)
	);
	if let Some(speed) = metrics.average_speed {
		line.push_str(&format!(" at {}/s", format_bytes(speed as u64)));
	}
	println!("{line}");
}

#[derive(Serialize)]
struct JsonSummary<'a> {
	outcomes: &'a [TaskOutcome],
	#[serde(flatten)]
	status: &'a PoolStatus,
}

pub fn print_json(outcomes: &[TaskOutcome], status: &PoolStatus) -> Result<()> {
	println!("{}", serde_json::to_string_pretty(&JsonSummary { outcomes, status })?);
	Ok(())
}

pub fn print_probe(target: &str, sample: &ProbeSample, params: &AdaptiveParams) {
	match (sample.reachable, sample.rtt) {
		(true, Some(rtt)) => println!("{} {target} reachable in {} ms", style("✓").green(), rtt.as_millis()),
		_ => println!("{} {target} unreachable", style("✗").red()),
	}
	println!(
		"  concurrency {}, batch size {}, timeout {}s, compression {}",
		params.max_concurrency,
		params.batch_size,
		params.timeout.as_secs(),
		if params.compression_enabled { "on" } else { "off" }
	);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bytes_are_human_readable() {
		assert_eq!(format_bytes(512), "512 B");
		assert_eq!(format_bytes(1536), "1.5 KB");
		assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
	}

	#[test]
	fn long_lines_are_truncated() {
		assert_eq!(truncate("short", 10), "short");
		assert_eq!(truncate("abcdefghijkl", 5), "abcd…");
	}
}
