// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Atomic rendering of secret fields to the shared directory.
//!
//! A render writes every changed field to a temporary file in the target
//! directory (mode set, fsynced) before renaming any of them into place. A
//! failure while staging deletes the temporaries and leaves the previous
//! files untouched. Renames then run in mapping order and the directory is
//! fsynced. Files whose bytes and mode already match are not rewritten.

use std::collections::BTreeMap;
use std::fs::{self, File, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use ward_common_secret::SecretBytes;

use crate::error::RenderError;
use crate::types::SecretRecord;

const TARGET_DIR_MODE: u32 = 0o755;

/// One secret field and the file it is rendered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
	pub field: String,
	pub file_name: String,
}

impl FileMapping {
	pub fn new(field: impl Into<String>, file_name: impl Into<String>) -> Self {
		Self {
			field: field.into(),
			file_name: file_name.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
	pub field: String,
	pub path: PathBuf,
	pub mode: u32,
	/// Hex SHA-256 of the content.
	pub sha256: String,
	/// False when the file already held this content.
	pub written: bool,
}

/// Whether `name` is usable as a file name directly inside the target directory.
pub fn is_plain_file_name(name: &str) -> bool {
	!name.is_empty()
		&& name != "."
		&& name != ".."
		&& !name.contains('/')
		&& !name.contains('\\')
		&& !name.contains('\0')
}

/// Sole writer of the shared directory.
#[derive(Debug, Clone)]
pub struct Renderer {
	inner: Arc<RendererInner>,
}

#[derive(Debug)]
struct RendererInner {
	target_dir: PathBuf,
	mode: u32,
	mappings: Vec<FileMapping>,
	lock: Mutex<()>,
}

impl Renderer {
	pub fn new(
		target_dir: impl Into<PathBuf>,
		mode: u32,
		mappings: Vec<FileMapping>,
	) -> Result<Self, RenderError> {
		if let Some(bad) = mappings.iter().find(|m| !is_plain_file_name(&m.file_name)) {
			return Err(RenderError::InvalidFileName(bad.file_name.clone()));
		}
		Ok(Self {
			inner: Arc::new(RendererInner {
				target_dir: target_dir.into(),
				mode,
				mappings,
				lock: Mutex::new(()),
			}),
		})
	}

	pub fn target_dir(&self) -> &Path {
		&self.inner.target_dir
	}

	pub fn mappings(&self) -> &[FileMapping] {
		&self.inner.mappings
	}

	/// Render every mapped field of `record`. Concurrent calls are serialized.
	#[instrument(skip(self, record), fields(path = %record.path, version = record.version))]
	pub async fn render(&self, record: &SecretRecord) -> Result<Vec<RenderedFile>, RenderError> {
		let mut contents = Vec::with_capacity(self.inner.mappings.len());
		for mapping in &self.inner.mappings {
			let value = record
				.data
				.get(&mapping.field)
				.ok_or_else(|| RenderError::MissingField(mapping.field.clone()))?;
			contents.push((mapping.clone(), value.clone()));
		}

		let _guard = self.inner.lock.lock().await;
		let inner = self.inner.clone();
		let files = tokio::task::spawn_blocking(move || write_all(&inner.target_dir, inner.mode, contents))
			.await
			.map_err(|e| {
				RenderError::write(
					self.inner.target_dir.clone(),
					std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
				)
			})??;

		let written = files.iter().filter(|f| f.written).count();
		info!(
			files = files.len(),
			written,
			target_dir = %self.inner.target_dir.display(),
			"rendered secret"
		);
		Ok(files)
	}

	/// Current contents of the rendered files, keyed by field.
	pub fn read_rendered(&self) -> std::io::Result<BTreeMap<String, Vec<u8>>> {
		self
			.inner
			.mappings
			.iter()
			.map(|m| Ok((m.field.clone(), fs::read(self.inner.target_dir.join(&m.file_name))?)))
			.collect()
	}
}

fn ensure_target_dir(dir: &Path) -> Result<(), RenderError> {
	if dir.is_dir() {
		return Ok(());
	}
	fs::create_dir_all(dir).map_err(|e| RenderError::write(dir, e))?;
	fs::set_permissions(dir, Permissions::from_mode(TARGET_DIR_MODE))
		.map_err(|e| RenderError::write(dir, e))?;
	debug!(dir = %dir.display(), "created target directory");
	Ok(())
}

fn unchanged(path: &Path, content: &[u8], mode: u32) -> bool {
	let Ok(metadata) = fs::metadata(path) else {
		return false;
	};
	if metadata.permissions().mode() & 0o7777 != mode {
		return false;
	}
	fs::read(path).map(|existing| existing == content).unwrap_or(false)
}

fn stage(dir: &Path, mode: u32, content: &[u8]) -> std::io::Result<NamedTempFile> {
	let mut tmp = tempfile::Builder::new().prefix(".ward-").tempfile_in(dir)?;
	tmp.as_file().set_permissions(Permissions::from_mode(mode))?;
	tmp.write_all(content)?;
	tmp.as_file().sync_all()?;
	Ok(tmp)
}

fn write_all(
	dir: &Path,
	mode: u32,
	contents: Vec<(FileMapping, SecretBytes)>,
) -> Result<Vec<RenderedFile>, RenderError> {
	ensure_target_dir(dir)?;

	// Phase 1: stage. Dropping `staged` on error removes every temporary.
	let mut staged: Vec<(PathBuf, Option<NamedTempFile>)> = Vec::with_capacity(contents.len());
	let mut files = Vec::with_capacity(contents.len());
	for (mapping, value) in &contents {
		let path = dir.join(&mapping.file_name);
		let content = value.expose().as_slice();
		let written = !unchanged(&path, content, mode);
		let tmp = if written {
			Some(stage(dir, mode, content).map_err(|e| RenderError::write(&path, e))?)
		} else {
			None
		};
		files.push(RenderedFile {
			field: mapping.field.clone(),
			path: path.clone(),
			mode,
			sha256: hex::encode(Sha256::digest(content)),
			written,
		});
		staged.push((path, tmp));
	}

	if files.iter().all(|f| !f.written) {
		return Ok(files);
	}

	// Phase 2: rename in mapping order.
	for (path, tmp) in staged {
		if let Some(tmp) = tmp {
			tmp.persist(&path).map_err(|e| RenderError::write(&path, e.error))?;
		}
	}
	File::open(dir)
		.and_then(|d| d.sync_all())
		.map_err(|e| RenderError::write(dir, e))?;

	Ok(files)
}
