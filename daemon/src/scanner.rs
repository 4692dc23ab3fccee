use std::path::Path;

use relay_core::{FileEntry, PathFilter, Settings, SettingsError};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
	#[error("source path does not exist: {0}")]
	SourcePathNotExists(String),

	#[error("source path is not a directory: {0}")]
	SourcePathNotDir(String),

	#[error("bad filter: {0}")]
	Filter(#[from] SettingsError),

	#[error("scan task failed: {0}")]
	Join(String),
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
	/// Root-relative paths, in walk order.
	pub files: Vec<FileEntry>,
	pub total_bytes: u64,
	/// Symlinks and entries we could not read.
	pub skipped: u64,
	pub excluded: u64,
	/// Files above `max_file_size`; left out of the transfer.
	pub oversized: u64,
}

/// Walk the local root and collect the files a sync-all should move.
/// Blocking; call through `spawn_blocking` from async code.
pub fn scan(settings: &Settings) -> Result<ScanResult, ScanError> {
	let filter = settings.filters()?;
	walk_source(&settings.transfer.local_root, &filter, settings.transfer.max_file_size)
}

fn walk_source(root: &Path, filter: &PathFilter, max_file_size: u64) -> Result<ScanResult, ScanError> {
	if !root.exists() {
		return Err(ScanError::SourcePathNotExists(root.display().to_string()));
	}
	if !root.is_dir() {
		return Err(ScanError::SourcePathNotDir(root.display().to_string()));
	}

	let mut result = ScanResult::default();

	for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
		let entry = match entry {
			Ok(e) => e,
			Err(_) => {
				result.skipped += 1;
				continue;
			}
		};

		if entry.file_type().is_symlink() {
			result.skipped += 1;
			continue;
		}
		if entry.file_type().is_dir() {
			continue;
		}

		let Ok(relative) = entry.path().strip_prefix(root) else {
			result.skipped += 1;
			continue;
		};
		if !filter.allows(relative) {
			result.excluded += 1;
			continue;
		}

		let size = match entry.metadata() {
			Ok(m) => m.len(),
			Err(_) => {
				result.skipped += 1;
				continue;
			}
		};
		if size > max_file_size {
			result.oversized += 1;
			continue;
		}

		result.total_bytes += size;
		result.files.push(FileEntry::new(relative, size));
	}

	Ok(result)
}
