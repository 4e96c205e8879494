//! Path normalization at the host boundary
//!
//! Roots arrive from the host in whatever form it uses; everything the
//! backends store and everything the events carry is an absolute path in
//! the platform's native form. This module is the only place conversions
//! happen. Case is preserved throughout: case-sensitivity is a property of
//! the file system, not of this crate.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, WatchError};

/// Normalize a root supplied by the host: make it absolute against the
/// current directory without touching the file system, strip trailing
/// separators and lexically collapse `.`/`..` components. On macOS the
/// result is NFD-canonicalised to match what FSEvents reports.
pub fn normalize_root(path: &Path) -> Result<PathBuf> {
	let absolute = if path.as_os_str().is_empty() {
		return Err(WatchError::InvalidPath(path.to_path_buf()));
	} else if path.is_absolute() {
		lexical_clean(path)
	} else {
		let cwd = std::env::current_dir().map_err(|_| WatchError::InvalidPath(path.to_path_buf()))?;
		lexical_clean(&cwd.join(path))
	};

	#[cfg(target_os = "macos")]
	let absolute = decompose_unicode(absolute);

	Ok(absolute)
}

/// Verify that a normalized root names an existing directory.
///
/// Split from [`normalize_root`] on purpose: stopping a watch on a root
/// that has since been deleted must still be able to address it.
pub fn validate_directory(path: &Path) -> Result<()> {
	match std::fs::metadata(path) {
		Ok(meta) if meta.is_dir() => Ok(()),
		Ok(_) => Err(WatchError::InvalidPath(path.to_path_buf())),
		Err(err) => Err(WatchError::from_subscribe_error(path.to_path_buf(), err)),
	}
}

/// Collapse `.` and `..` components and trailing separators without
/// resolving symlinks. `..` at the root stays at the root.
fn lexical_clean(path: &Path) -> PathBuf {
	let mut cleaned = PathBuf::new();
	for component in path.components() {
		match component {
			Component::CurDir => {}
			Component::ParentDir => {
				// Never pop past a prefix or the root marker.
				if !matches!(
					cleaned.components().next_back(),
					None | Some(Component::RootDir) | Some(Component::Prefix(_))
				) {
					cleaned.pop();
				}
			}
			other => cleaned.push(other),
		}
	}
	cleaned
}

#[cfg(target_os = "macos")]
fn decompose_unicode(path: PathBuf) -> PathBuf {
	use unicode_normalization::{is_nfd, UnicodeNormalization};

	// HFS+ stores and FSEvents reports decomposed form; paths that are not
	// valid UTF-8 cannot be normalised and pass through untouched.
	match path.to_str() {
		Some(s) if !is_nfd(s) => PathBuf::from(s.nfd().collect::<String>()),
		_ => path,
	}
}

/// Prefix a path with the extended-length escape when it would exceed the
/// legacy `MAX_PATH` limit. Verbatim and device paths pass through.
#[cfg(windows)]
pub fn to_extended_length(path: &Path) -> PathBuf {
	use std::ffi::OsString;
	use std::os::windows::ffi::{OsStrExt, OsStringExt};

	const LEGACY_MAX_PATH: usize = 260;

	let wide: Vec<u16> = path.as_os_str().encode_wide().collect();
	if wide.len() < LEGACY_MAX_PATH {
		return path.to_path_buf();
	}
	if wide.starts_with(&[b'\\' as u16, b'\\' as u16, b'?' as u16, b'\\' as u16])
		|| wide.starts_with(&[b'\\' as u16, b'\\' as u16, b'.' as u16, b'\\' as u16])
	{
		return path.to_path_buf();
	}

	// UNC paths swap their leading "\\" for the "\\?\UNC\" form.
	let mut prefixed: Vec<u16> = Vec::with_capacity(wide.len() + 8);
	if wide.starts_with(&[b'\\' as u16, b'\\' as u16]) {
		prefixed.extend(r"\\?\UNC\".encode_utf16());
		prefixed.extend_from_slice(&wide[2..]);
	} else {
		prefixed.extend(r"\\?\".encode_utf16());
		prefixed.extend_from_slice(&wide);
	}
	PathBuf::from(OsString::from_wide(&prefixed))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn trailing_separators_are_stripped() {
		#[cfg(unix)]
		assert_eq!(lexical_clean(Path::new("/tmp/watch/")), PathBuf::from("/tmp/watch"));
		#[cfg(windows)]
		assert_eq!(
			lexical_clean(Path::new(r"C:\tmp\watch\")),
			PathBuf::from(r"C:\tmp\watch")
		);
	}

	#[cfg(unix)]
	#[test]
	fn dot_components_collapse() {
		assert_eq!(
			lexical_clean(Path::new("/tmp/./watch/../other")),
			PathBuf::from("/tmp/other")
		);
		assert_eq!(lexical_clean(Path::new("/../up")), PathBuf::from("/up"));
	}

	#[cfg(unix)]
	#[test]
	fn root_marker_survives() {
		assert_eq!(lexical_clean(Path::new("/")), PathBuf::from("/"));
	}

	#[test]
	fn relative_roots_become_absolute() {
		let normalized = normalize_root(Path::new("some/dir")).unwrap();
		assert!(normalized.is_absolute());
		assert!(normalized.ends_with("some/dir"));
	}

	#[test]
	fn empty_path_is_invalid() {
		assert!(matches!(
			normalize_root(Path::new("")),
			Err(WatchError::InvalidPath(_))
		));
	}

	#[test]
	fn missing_directory_fails_validation() {
		let dir = tempfile::tempdir().unwrap();
		let missing = dir.path().join("nope");
		assert!(matches!(
			validate_directory(&missing),
			Err(WatchError::InvalidPath(_))
		));
	}

	#[test]
	fn file_fails_validation() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("plain.txt");
		std::fs::write(&file, b"x").unwrap();
		assert!(matches!(
			validate_directory(&file),
			Err(WatchError::InvalidPath(_))
		));
	}
}
