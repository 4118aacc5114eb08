#![forbid(unsafe_code)]

//! TOML persistence for the favorite slot binding table.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use tether_core::SlotBindings;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BindingsFile {
	path: PathBuf,
}

impl BindingsFile {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// A missing file is an empty table.
	pub fn load(&self) -> anyhow::Result<SlotBindings> {
		match fs::read_to_string(&self.path) {
			Ok(s) => toml::from_str(&s).with_context(|| format!("parse {}", self.path.display())),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SlotBindings::new()),
			Err(e) => Err(anyhow!(e).context(format!("read {}", self.path.display()))),
		}
	}

	/// Write through a temporary file so a crash never leaves a truncated table.
	pub fn save(&self, bindings: &SlotBindings) -> anyhow::Result<()> {
		if let Some(dir) = self.path.parent() {
			fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
		}
		let text = toml::to_string(bindings).context("serialize slot bindings")?;
		let tmp = self.path.with_extension("toml.tmp");
		fs::write(&tmp, text).with_context(|| format!("write {}", tmp.display()))?;
		fs::rename(&tmp, &self.path).with_context(|| format!("replace {}", self.path.display()))?;
		debug!(path = %self.path.display(), groups = bindings.len(), "bindings: saved");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use tether_core::SlotRef;
	use tether_domain::FavoriteKind;

	use super::*;

	#[test]
	fn missing_file_loads_empty() {
		let dir = tempfile::tempdir().expect("tempdir");
		let file = BindingsFile::new(dir.path().join("favorite_slots.toml"));
		assert!(file.load().expect("load").is_empty());
	}

	#[test]
	fn saved_table_loads_back() {
		let dir = tempfile::tempdir().expect("tempdir");
		let file = BindingsFile::new(dir.path().join("nested").join("favorite_slots.toml"));

		let mut bindings = SlotBindings::new();
		bindings.insert(
			"fvgrp_0b1c-22",
			SlotRef {
				kind: FavoriteKind::World,
				index: 2,
			},
		);
		bindings.insert(
			"fvgrp_9",
			SlotRef {
				kind: FavoriteKind::Friend,
				index: 0,
			},
		);
		file.save(&bindings).expect("save");

		assert_eq!(file.load().expect("load"), bindings);
		assert!(!file.path().with_extension("toml.tmp").exists());
	}

	#[test]
	fn corrupt_file_is_an_error() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("favorite_slots.toml");
		fs::write(&path, "this is = = not toml").expect("write");
		assert!(BindingsFile::new(path).load().is_err());
	}
}
