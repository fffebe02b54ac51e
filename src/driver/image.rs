/*
 * This file is part of Hwprobe.
 *
 * Copyright (C) 2025 Hwprobe contributors
 *
 * Hwprobe is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Hwprobe is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Hwprobe. If not, see <https://www.gnu.org/licenses/>.
 */

//! Driver image packaging and extraction.
//!
//! The driver ships gzip-compressed, either embedded by the host binary or
//! as a `*.sys.gz` package next to it. Extraction decompresses the image to
//! a writable location and waits for the file to be fully visible on disk;
//! antivirus scanners and write caching can delay that noticeably.

use std::borrow::Cow;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::constants::driver::{FALLBACK_SERVICE_NAME, IMAGE_EXTENSION, IMAGE_X64, IMAGE_X86};
use crate::constants::timing::EXTRACT_POLL;
use crate::error::{ProbeError, Result};

/// Where the compressed driver image comes from.
#[derive(Debug, Clone)]
pub enum DriverImage {
    /// gzip bytes already in memory, e.g. from `include_bytes!`.
    Compressed(Cow<'static, [u8]>),
    /// Path to a gzip package on disk.
    Package(PathBuf),
}

impl DriverImage {
    pub fn from_compressed(bytes: impl Into<Cow<'static, [u8]>>) -> Self {
        Self::Compressed(bytes.into())
    }

    pub fn from_package(path: impl Into<PathBuf>) -> Self {
        Self::Package(path.into())
    }

    /// The package in `dir` matching the host's pointer width.
    pub fn for_host(dir: &Path) -> Self {
        let file = if cfg!(target_pointer_width = "64") {
            IMAGE_X64
        } else {
            IMAGE_X86
        };
        Self::Package(dir.join(file))
    }

    fn compressed(&self) -> Result<Cow<'_, [u8]>> {
        match self {
            Self::Compressed(bytes) => Ok(Cow::Borrowed(bytes.as_ref())),
            Self::Package(path) => {
                if !path.exists() {
                    return Err(ProbeError::FileNotFound(path.clone()));
                }
                Ok(Cow::Owned(fs::read(path)?))
            }
        }
    }

    /// The raw driver binary.
    pub fn decompress(&self) -> Result<Vec<u8>> {
        decompress_image(&self.compressed()?)
    }
}

/// gunzip a packaged image. The first decompressed byte is a packaging
/// marker, not part of the driver binary.
pub fn decompress_image(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut decoded)
        .map_err(|e| ProbeError::Decompress(e.to_string()))?;
    if decoded.is_empty() {
        return Err(ProbeError::Decompress("empty driver image".into()));
    }
    decoded.remove(0);
    Ok(decoded)
}

/// Write the decompressed image to `dest` and wait up to `timeout` for the
/// file to reach its full length.
pub fn extract(image: &DriverImage, dest: &Path, timeout: Duration) -> anyhow::Result<()> {
    let binary = image.decompress().context("reading driver image")?;
    fs::write(dest, &binary)
        .with_context(|| format!("writing driver image to {}", dest.display()))?;
    if !wait_for_file(dest, binary.len() as u64, timeout) {
        anyhow::bail!(
            "driver image at {} did not reach {} bytes within {:?}",
            dest.display(),
            binary.len(),
            timeout
        );
    }
    debug!(path = %dest.display(), bytes = binary.len(), "driver image extracted");
    Ok(())
}

/// Poll until `path` exists with exactly `expected_len` bytes.
pub fn wait_for_file(path: &Path, expected_len: u64, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if fs::metadata(path).map(|m| m.len() == expected_len).unwrap_or(false) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(EXTRACT_POLL);
    }
}

/// Service name derived from the host executable: file stem with spaces
/// removed and dots replaced, so two differently named tools never share
/// (and tear down) each other's service.
pub fn service_name_for(exe: Option<&Path>) -> String {
    let stem = exe
        .and_then(|p| p.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.trim().is_empty());
    let name = stem.unwrap_or_else(|| FALLBACK_SERVICE_NAME.to_string());
    name.replace(' ', "").replace('.', "_")
}

pub fn host_service_name() -> String {
    service_name_for(env::current_exe().ok().as_deref())
}

/// Locations to try for the extracted image, most preferred first.
pub fn candidate_paths(service_name: &str, extract_dir: Option<&Path>) -> Vec<PathBuf> {
    let file_name = format!("{service_name}.{IMAGE_EXTENSION}");
    let mut paths = Vec::new();
    if let Some(dir) = extract_dir {
        paths.push(dir.join(&file_name));
    }
    if let Ok(exe) = env::current_exe() {
        paths.push(exe.with_extension(IMAGE_EXTENSION));
    }
    paths.push(env::temp_dir().join(file_name));
    paths
}

/// First candidate we can create or open for writing.
pub fn writable_path(candidates: &[PathBuf]) -> Option<PathBuf> {
    for path in candidates {
        match OpenOptions::new().create(true).write(true).truncate(true).open(path) {
            Ok(_) => return Some(path.clone()),
            Err(e) => debug!(path = %path.display(), "driver image location not writable: {e}"),
        }
    }
    warn!("no writable location for the driver image");
    None
}
