use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::classify::{classify, Category, MIB};

/// Safety cap on the cumulative size of one batch.
pub const MAX_BATCH_BYTES: u64 = 100 * MIB;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
	pub path: PathBuf,
	pub size: u64,
}

impl FileEntry {
	pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
		FileEntry { path: path.into(), size }
	}
}

/// Files of one category sent through a single executor invocation.
/// Formed once and never re-split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
	pub category: Category,
	pub files: Vec<FileEntry>,
}

impl Batch {
	pub fn len(&self) -> usize {
		self.files.len()
	}

	pub fn is_empty(&self) -> bool {
		self.files.is_empty()
	}

	pub fn total_bytes(&self) -> u64 {
		self.files.iter().map(|f| f.size).sum()
	}

	pub fn paths(&self) -> Vec<PathBuf> {
		self.files.iter().map(|f| f.path.clone()).collect()
	}
}

/// Partition files of one batchable category into batches, in input order.
pub fn batch_files(category: Category, files: Vec<FileEntry>, batch_size: usize) -> Vec<Batch> {
	batch_with_cap(category, files, batch_size, MAX_BATCH_BYTES)
}

fn batch_with_cap(category: Category, files: Vec<FileEntry>, batch_size: usize, max_bytes: u64) -> Vec<Batch> {
	let batch_size = batch_size.max(1);
	let mut batches = Vec::new();
	let mut current: Vec<FileEntry> = Vec::new();
	let mut current_bytes = 0u64;

	for file in files {
		let over_count = current.len() + 1 > batch_size;
		let over_size = current_bytes.saturating_add(file.size) > max_bytes;
		// An oversized file still needs a home; it gets a batch of its own.
		if !current.is_empty() && (over_count || over_size) {
			batches.push(Batch { category, files: std::mem::take(&mut current) });
			current_bytes = 0;
		}
		current_bytes = current_bytes.saturating_add(file.size);
		current.push(file);
	}

	if !current.is_empty() {
		batches.push(Batch { category, files: current });
	}
	batches
}

/// One schedulable piece of a multi-file request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
	Single { category: Category, file: FileEntry },
	Batch(Batch),
}

impl Unit {
	pub fn category(&self) -> Category {
		match self {
			Unit::Single { category, .. } => *category,
			Unit::Batch(b) => b.category,
		}
	}
}

/// Classify and batch a multi-file request. Units come back in tier order;
/// config and large files are singles, everything else is batched per category.
pub fn plan(files: Vec<FileEntry>, batch_size: usize) -> Vec<Unit> {
	let mut buckets: [Vec<FileEntry>; 5] = Default::default();
	for file in files {
		let category = classify(&file.path, file.size);
		buckets[category.tier() as usize].push(file);
	}

	let mut units = Vec::new();
	for (category, files) in Category::ALL.into_iter().zip(buckets) {
		if category.is_batchable() {
			units.extend(batch_files(category, files, batch_size).into_iter().map(Unit::Batch));
		} else {
			units.extend(files.into_iter().map(|file| Unit::Single { category, file }));
		}
	}
	units
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::classify::KIB;

	fn files(n: usize, size: u64) -> Vec<FileEntry> {
		(0..n).map(|i| FileEntry::new(format!("f{i}.txt"), size)).collect()
	}

	#[test]
	fn empty_input_no_batches() {
		assert!(batch_files(Category::Small, Vec::new(), 10).is_empty());
	}

	#[test]
	fn exactly_cap_is_one_batch() {
		let batches = batch_files(Category::Small, files(5, 10), 5);
		assert_eq!(batches.len(), 1);
		assert_eq!(batches[0].len(), 5);
	}

	#[test]
	fn one_over_cap_is_two_batches() {
		let batches = batch_files(Category::Small, files(6, 10), 5);
		assert_eq!(batches.len(), 2);
		assert_eq!(batches[0].len(), 5);
		assert_eq!(batches[1].len(), 1);
		assert_eq!(batches[1].files[0].path, PathBuf::from("f5.txt"));
	}

	#[test]
	fn size_cap_closes_batch() {
		let batches = batch_with_cap(Category::Medium, files(4, 40), 50, 100);
		let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
		assert_eq!(sizes, vec![2, 2]);
		assert!(batches.iter().all(|b| b.total_bytes() <= 100));
	}

	#[test]
	fn oversized_file_gets_its_own_batch() {
		let input = vec![FileEntry::new("a", 10), FileEntry::new("b", 500), FileEntry::new("c", 10)];
		let batches = batch_with_cap(Category::Binary, input, 50, 100);
		let names: Vec<Vec<PathBuf>> = batches.iter().map(Batch::paths).collect();
		assert_eq!(names, vec![vec![PathBuf::from("a")], vec![PathBuf::from("b")], vec![PathBuf::from("c")]]);
	}

	#[test]
	fn zero_batch_size_treated_as_one() {
		assert_eq!(batch_files(Category::Small, files(3, 1), 0).len(), 3);
	}

	#[test]
	fn plan_mixed_sizes() {
		let input = vec![
			FileEntry::new("big.dat", 15 * MIB),
			FileEntry::new("notes.txt", 500 * KIB),
			FileEntry::new("dump.sql", 2 * MIB),
		];
		let units = plan(input, 50);

		assert_eq!(units.len(), 3);
		match &units[0] {
			Unit::Batch(b) => {
				assert_eq!(b.category, Category::Small);
				assert_eq!(b.paths(), vec![PathBuf::from("notes.txt")]);
			}
			other => panic!("expected small batch, got {other:?}"),
		}
		match &units[1] {
			Unit::Batch(b) => assert_eq!(b.category, Category::Medium),
			other => panic!("expected medium batch, got {other:?}"),
		}
		assert_eq!(units[2], Unit::Single { category: Category::Large, file: FileEntry::new("big.dat", 15 * MIB) });
	}

	#[test]
	fn plan_puts_config_first_and_never_batches_it() {
		let input = vec![
			FileEntry::new("a.txt", 1),
			FileEntry::new("Makefile", 1),
			FileEntry::new("b.txt", 1),
			FileEntry::new(".env", 1),
		];
		let units = plan(input, 50);

		assert_eq!(units[0].category(), Category::Config);
		assert_eq!(units[1].category(), Category::Config);
		assert!(matches!(units[0], Unit::Single { .. }));
		match &units[2] {
			Unit::Batch(b) => assert_eq!(b.len(), 2),
			other => panic!("expected batch, got {other:?}"),
		}
	}

	#[test]
	fn tiers_never_mix_in_a_batch() {
		let input = vec![FileEntry::new("a.txt", 1), FileEntry::new("b.png", 1), FileEntry::new("c.txt", 2 * MIB)];
		for unit in plan(input, 50) {
			if let Unit::Batch(b) = unit {
				assert!(b.files.iter().all(|f| classify(&f.path, f.size) == b.category));
			}
		}
	}
}
