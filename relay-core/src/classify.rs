use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// Files below this are `Small`.
pub const SMALL_LIMIT: u64 = MIB;
/// Files at or above this are `Large` and always go alone.
pub const LARGE_THRESHOLD: u64 = 10 * MIB;

/// File category. Declaration order is admission priority: `Config` first, `Large` last.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Category {
	Config,
	Small,
	Medium,
	Binary,
	Large,
}

impl Category {
	pub const ALL: [Category; 5] = [Category::Config, Category::Small, Category::Medium, Category::Binary, Category::Large];

	/// Priority tier, 0 is admitted first.
	pub fn tier(self) -> u8 {
		self as u8
	}

	/// Whether files of this category may share an executor invocation.
	pub fn is_batchable(self) -> bool {
		matches!(self, Category::Small | Category::Medium | Category::Binary)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Category::Config => "config",
			Category::Small => "small",
			Category::Medium => "medium",
			Category::Binary => "binary",
			Category::Large => "large",
		}
	}
}

impl fmt::Display for Category {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

const CONFIG_NAMES: &[&str] = &[
	"Makefile",
	"Dockerfile",
	"Procfile",
	"Vagrantfile",
	"Gemfile",
	"Cargo.toml",
	"package.json",
	"composer.json",
	"tsconfig.json",
	"pyproject.toml",
	"requirements.txt",
	"docker-compose.yml",
	"docker-compose.yaml",
	".gitignore",
	".gitattributes",
	".editorconfig",
	".htaccess",
	".npmrc",
	".nvmrc",
];

const CONFIG_PREFIXES: &[&str] = &[".env"];

const CONFIG_EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "ini", "conf", "cfg", "env", "properties", "plist"];

const BINARY_EXTENSIONS: &[&str] = &[
	// images
	"png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tiff", "psd",
	// audio / video
	"mp3", "wav", "flac", "ogg", "mp4", "mov", "avi", "mkv", "webm",
	// archives
	"zip", "tar", "gz", "tgz", "bz2", "xz", "7z", "rar", "zst",
	// executables and libraries
	"exe", "dll", "so", "dylib", "bin", "o", "a", "class", "jar", "wasm",
	// disk images, documents, fonts
	"iso", "dmg", "img", "pdf", "woff", "woff2", "ttf", "otf",
];

/// Classify a file from its path and size.
pub fn classify(path: &Path, size: u64) -> Category {
	let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
	let extension = path.extension().and_then(|e| e.to_str());
	classify_name(name, extension, size)
}

/// Table-driven classification. Config beats every other rule and a binary
/// extension beats the size buckets.
pub fn classify_name(name: &str, extension: Option<&str>, size: u64) -> Category {
	let ext = extension.map(str::to_ascii_lowercase);
	let ext = ext.as_deref();

	if is_config(name, ext) {
		return Category::Config;
	}
	if ext.is_some_and(|e| BINARY_EXTENSIONS.contains(&e)) {
		return Category::Binary;
	}
	if size < SMALL_LIMIT {
		Category::Small
	} else if size < LARGE_THRESHOLD {
		Category::Medium
	} else {
		Category::Large
	}
}

fn is_config(name: &str, ext: Option<&str>) -> bool {
	CONFIG_NAMES.contains(&name)
		|| CONFIG_PREFIXES.iter().any(|p| name.starts_with(p))
		|| ext.is_some_and(|e| CONFIG_EXTENSIONS.contains(&e))
}
