use std::{collections::VecDeque, io::Write, path::Path, process::Stdio, time::Duration};

use relay_core::TaskKind;
use tempfile::NamedTempFile;
use tokio::{
	io::{AsyncBufReadExt, AsyncRead, BufReader},
	process::{Child, Command},
	sync::mpsc,
};
use tracing::{debug, warn};

use crate::executor::{
	kill_switch, ExecError, ExecHandle, ExitReport, Invocation, KillSignal, Reporter, TransferExecutor, OUTPUT_TAIL,
};

const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Runs each invocation as one `rsync` process.
#[derive(Debug, Clone, Copy, Default)]
pub struct RsyncExecutor;

impl TransferExecutor for RsyncExecutor {
	fn start(&self, invocation: Invocation, reporter: Reporter) -> Result<ExecHandle, ExecError> {
		// Batches hand rsync their file list through a temp file that lives until the process exits.
		let list = if invocation.kind == TaskKind::Batch {
			Some(write_file_list(&invocation)?)
		} else {
			None
		};

		let args = build_args(&invocation, list.as_ref().map(|l| l.path()));
		debug!(task = %invocation.task, args = ?args, "spawning rsync");

		let mut child = Command::new(&invocation.options.rsync_path)
			.args(&args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| ExecError::Start(format!("{}: {e}", invocation.options.rsync_path)))?;

		let (handle, kill) = kill_switch();
		let (line_tx, line_rx) = mpsc::unbounded_channel();
		if let Some(stdout) = child.stdout.take() {
			tokio::spawn(forward_lines(stdout, line_tx.clone()));
		}
		if let Some(stderr) = child.stderr.take() {
			tokio::spawn(forward_lines(stderr, line_tx));
		}

		tokio::spawn(async move {
			supervise(child, line_rx, reporter, kill).await;
			drop(list);
		});

		Ok(handle)
	}
}

fn write_file_list(invocation: &Invocation) -> Result<NamedTempFile, ExecError> {
	let mut list = NamedTempFile::new().map_err(|e| ExecError::Start(format!("file list: {e}")))?;
	for file in &invocation.files {
		writeln!(list, "{}", file.display()).map_err(|e| ExecError::Start(format!("file list: {e}")))?;
	}
	list.flush().map_err(|e| ExecError::Start(format!("file list: {e}")))?;
	Ok(list)
}

/// rsync argument vector for an invocation.
pub fn build_args(invocation: &Invocation, file_list: Option<&Path>) -> Vec<String> {
	let options = &invocation.options;
	let mut args = vec!["--archive".to_string(), "--stats".to_string()];

	if options.compress {
		args.push("--compress".into());
	}
	args.push(format!("--timeout={}", options.timeout.as_secs().max(1)));

	let mut ssh = format!("ssh -p {} -o BatchMode=yes", options.ssh_port);
	if let Some(identity) = &options.identity_file {
		ssh.push_str(&format!(" -i {}", identity.display()));
	}
	args.push("-e".into());
	args.push(ssh);

	for pattern in &options.excludes {
		args.push(format!("--exclude={pattern}"));
	}
	args.extend(options.extra_args.iter().cloned());

	if let Some(list) = file_list {
		args.push(format!("--files-from={}", list.display()));
	}

	args.push(invocation.source.clone());
	args.push(invocation.destination.clone());
	args
}

/// rsync echoes file names verbatim, so lines are not always UTF-8.
async fn forward_lines<R: AsyncRead + Unpin>(stream: R, tx: mpsc::UnboundedSender<String>) {
	let mut reader = BufReader::new(stream);
	let mut buf = Vec::new();
	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf).await {
			Ok(0) | Err(_) => break,
			Ok(_) => {}
		}
		let line = String::from_utf8_lossy(&buf);
		let line = line.trim_end_matches(['\n', '\r']);
		if tx.send(line.to_string()).is_err() {
			break;
		}
	}
}

async fn supervise(mut child: Child, mut lines: mpsc::UnboundedReceiver<String>, reporter: Reporter, mut kill: KillSignal) {
	let mut tail: VecDeque<String> = VecDeque::with_capacity(OUTPUT_TAIL);
	let mut bytes = None;

	let status = loop {
		tokio::select! {
			Some(line) = lines.recv() => {
				take_line(&line, &mut tail, &mut bytes);
				reporter.progress(line);
			}
			status = child.wait() => break status.ok(),
			_ = kill.requested() => {
				terminate(&mut child).await;
				reporter.finish(ExitReport::failed(None, vec!["terminated".into()]));
				return;
			}
		}
	};

	// Readers hit EOF once the process is gone.
	while let Some(line) = lines.recv().await {
		take_line(&line, &mut tail, &mut bytes);
		reporter.progress(line);
	}

	let code = status.and_then(|s| s.code());
	let report = ExitReport { code, bytes, output: tail.into() };
	if !report.success() {
		debug!(task = %reporter.task(), code = ?code, "rsync exited with failure");
	}
	reporter.finish(report);
}

fn take_line(line: &str, tail: &mut VecDeque<String>, bytes: &mut Option<u64>) {
	if let Some(n) = parse_transferred_bytes(line) {
		*bytes = Some(n);
	}
	if tail.len() == OUTPUT_TAIL {
		tail.pop_front();
	}
	tail.push_back(line.to_string());
}

/// Reads `Total transferred file size: 1,234 bytes` from `--stats` output.
pub fn parse_transferred_bytes(line: &str) -> Option<u64> {
	let rest = line.trim().strip_prefix("Total transferred file size:")?.trim();
	let end = rest.find(|c: char| !(c.is_ascii_digit() || c == ',')).unwrap_or(rest.len());
	let (digits, unit) = rest.split_at(end);
	if !(unit.trim().is_empty() || unit.trim() == "bytes") {
		return None;
	}
	digits.replace(',', "").parse().ok()
}

/// SIGTERM first, SIGKILL if rsync ignores it.
async fn terminate(child: &mut Child) {
	#[cfg(unix)]
	if let Some(pid) = child.id() {
		// SAFETY: plain signal delivery to our own child process.
		unsafe {
			libc::kill(pid as libc::pid_t, libc::SIGTERM);
		}
		if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
			return;
		}
	}

	if let Err(e) = child.kill().await {
		warn!("failed to kill rsync: {e}");
	}
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use relay_core::{Direction, TaskId};

	use super::*;
	use crate::executor::TransferOptions;

	fn invocation(kind: TaskKind) -> Invocation {
		Invocation {
			task: TaskId::new(),
			kind,
			direction: Direction::Upload,
			source: "/home/me/project/".into(),
			destination: "deploy@example.com:/srv/app/".into(),
			files: vec![PathBuf::from("a.txt"), PathBuf::from("src/b.rs")],
			options: TransferOptions {
				compress: true,
				timeout: Duration::from_secs(60),
				ssh_port: 2222,
				identity_file: Some(PathBuf::from("/home/me/.ssh/id_ed25519")),
				excludes: vec![".git".into()],
				rsync_path: "rsync".into(),
				extra_args: vec!["--delete".into()],
			},
		}
	}

	#[test]
	fn args_for_batch() {
		let args = build_args(&invocation(TaskKind::Batch), Some(Path::new("/tmp/list")));
		assert_eq!(
			args,
			vec![
				"--archive",
				"--stats",
				"--compress",
				"--timeout=60",
				"-e",
				"ssh -p 2222 -o BatchMode=yes -i /home/me/.ssh/id_ed25519",
				"--exclude=.git",
				"--delete",
				"--files-from=/tmp/list",
				"/home/me/project/",
				"deploy@example.com:/srv/app/",
			]
		);
	}

	#[test]
	fn args_without_compression() {
		let mut inv = invocation(TaskKind::SingleFile);
		inv.options.compress = false;
		let args = build_args(&inv, None);
		assert!(!args.contains(&"--compress".to_string()));
		assert!(!args.iter().any(|a| a.starts_with("--files-from")));
	}

	#[test]
	fn file_list_has_one_path_per_line() {
		let list = write_file_list(&invocation(TaskKind::Batch)).unwrap();
		let text = std::fs::read_to_string(list.path()).unwrap();
		assert_eq!(text, "a.txt\nsrc/b.rs\n");
	}

	#[test]
	fn parses_stats_bytes() {
		assert_eq!(parse_transferred_bytes("Total transferred file size: 1,234,567 bytes"), Some(1_234_567));
		assert_eq!(parse_transferred_bytes("Total transferred file size: 0 bytes"), Some(0));
		assert_eq!(parse_transferred_bytes("Total file size: 99 bytes"), None);
		// human-readable sizes are not exact byte counts
		assert_eq!(parse_transferred_bytes("Total transferred file size: 1.23M bytes"), None);
	}

	#[tokio::test]
	async fn non_utf8_lines_do_not_stop_the_stream() {
		let output: &[u8] = b"sending incremental file list\nphotos/caf\xe9.jpg\r\nsent 42 bytes\n";
		let (tx, mut rx) = mpsc::unbounded_channel();

		forward_lines(output, tx).await;

		let mut lines = Vec::new();
		while let Some(line) = rx.recv().await {
			lines.push(line);
		}
		assert_eq!(lines, vec!["sending incremental file list", "photos/caf\u{fffd}.jpg", "sent 42 bytes"]);
	}

	#[tokio::test]
	async fn missing_binary_is_a_start_failure() {
		let (tx, _rx) = mpsc::unbounded_channel();
		let mut inv = invocation(TaskKind::SingleFile);
		inv.options.rsync_path = "/nonexistent/relay-test-rsync".into();
		let reporter = Reporter::new(inv.task, 1, tx);

		let err = RsyncExecutor.start(inv, reporter).unwrap_err();
		assert!(matches!(err, ExecError::Start(_)));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn streams_output_and_exit_code() {
		use std::os::unix::fs::PermissionsExt;

		use crate::executor::ExecEventKind;

		let tmp = tempfile::tempdir().unwrap();
		let script = tmp.path().join("fake-rsync");
		std::fs::write(&script, "#!/bin/sh\necho 'Total transferred file size: 42 bytes'\necho 'oops' >&2\nexit 23\n").unwrap();
		std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

		let mut inv = invocation(TaskKind::SingleFile);
		inv.options.rsync_path = script.display().to_string();
		let (tx, mut rx) = mpsc::unbounded_channel();
		let reporter = Reporter::new(inv.task, 1, tx);

		let _handle = RsyncExecutor.start(inv, reporter).unwrap();

		let mut lines = Vec::new();
		let report = loop {
			match rx.recv().await.unwrap().kind {
				ExecEventKind::Progress(line) => lines.push(line),
				ExecEventKind::Finished(report) => break report,
			}
		};
		assert_eq!(report.code, Some(23));
		assert_eq!(report.bytes, Some(42));
		assert!(lines.contains(&"oops".to_string()));
		assert_eq!(report.output.len(), 2);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn terminate_stops_the_process() {
		use std::os::unix::fs::PermissionsExt;

		use crate::executor::ExecEventKind;

		let tmp = tempfile::tempdir().unwrap();
		let script = tmp.path().join("slow-rsync");
		std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
		std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

		let mut inv = invocation(TaskKind::Directory);
		inv.options.rsync_path = script.display().to_string();
		let (tx, mut rx) = mpsc::unbounded_channel();
		let reporter = Reporter::new(inv.task, 1, tx);

		let mut handle = RsyncExecutor.start(inv, reporter).unwrap();
		assert!(handle.terminate());

		let finished = tokio::time::timeout(Duration::from_secs(10), async {
			loop {
				if let ExecEventKind::Finished(report) = rx.recv().await.unwrap().kind {
					break report;
				}
			}
		})
		.await
		.unwrap();
		assert!(!finished.success());
	}
}
