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

//! Host configuration for the Ring0 context.
//!
//! Everything has a default, so a missing file is not an error. The file is
//! JSON and looked up in the usual places (see [`config_path`]).

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::driver::DRIVER_ID;
use crate::constants::paths::{CONFIG_DIR_NAME, CONFIG_ENV, CONFIG_FILE, SYSTEM_CONFIG};
use crate::constants::timing::{BUS_TIMEOUT_MS, EXTRACT_TIMEOUT_MS, INSTALL_RETRY_DELAY_MS};
use crate::driver::image::{host_service_name, DriverImage};
use crate::driver::DriverIdentity;
use crate::error::{ProbeError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Ring0Config {
    /// Service name override. Derived from the host executable when unset.
    pub service_name: Option<String>,
    /// Device name the driver registers.
    pub driver_id: String,
    /// Directory holding `ring0_x64.sys.gz` / `ring0_x86.sys.gz`.
    /// Defaults to the executable's directory.
    pub driver_package_dir: Option<PathBuf>,
    /// Preferred directory for the extracted driver.
    pub extract_dir: Option<PathBuf>,
    pub extract_timeout_ms: u64,
    pub install_retry_delay_ms: u64,
    pub bus_timeout_ms: u64,
}

impl Default for Ring0Config {
    fn default() -> Self {
        Self {
            service_name: None,
            driver_id: DRIVER_ID.to_string(),
            driver_package_dir: None,
            extract_dir: None,
            extract_timeout_ms: EXTRACT_TIMEOUT_MS,
            install_retry_delay_ms: INSTALL_RETRY_DELAY_MS,
            bus_timeout_ms: BUS_TIMEOUT_MS,
        }
    }
}

impl Ring0Config {
    pub fn service_name(&self) -> String {
        self.service_name.clone().unwrap_or_else(host_service_name)
    }

    pub fn identity(&self) -> DriverIdentity {
        DriverIdentity::new(self.service_name(), self.driver_id.clone())
    }

    /// The packaged driver matching the host's pointer width.
    pub fn driver_image(&self) -> DriverImage {
        let dir = self.driver_package_dir.clone().unwrap_or_else(|| {
            env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("."))
        });
        DriverImage::for_host(&dir)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }

    pub fn install_retry_delay(&self) -> Duration {
        Duration::from_millis(self.install_retry_delay_ms)
    }

    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_timeout_ms)
    }
}

/// Config file location: `$HWPROBE_CONFIG`, then the XDG config dir, then
/// `~/.config`, then the system-wide file.
pub fn config_path() -> PathBuf {
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME").filter(|p| !p.is_empty()) {
        return PathBuf::from(xdg).join(CONFIG_DIR_NAME).join(CONFIG_FILE);
    }
    if let Some(home) = env::var_os("HOME").filter(|p| !p.is_empty()) {
        return PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE);
    }
    system_config_path()
}

pub fn system_config_path() -> PathBuf {
    PathBuf::from(SYSTEM_CONFIG)
}

pub fn load_config() -> Result<Ring0Config> {
    load_config_from(&config_path())
}

/// Read and validate `path`. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Ring0Config> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Ring0Config::default());
        }
        Err(e) => return Err(e.into()),
    };
    let cfg: Ring0Config = serde_json::from_str(&data)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Ring0Config) -> Result<()> {
    if !is_safe_name(&cfg.driver_id) {
        return Err(ProbeError::config("invalid driver_id"));
    }
    if let Some(name) = &cfg.service_name {
        if !is_safe_name(name) {
            return Err(ProbeError::config("invalid service_name"));
        }
    }
    if cfg.extract_timeout_ms == 0 {
        return Err(ProbeError::config("extract_timeout_ms must be positive"));
    }
    if cfg.bus_timeout_ms == 0 {
        return Err(ProbeError::config("bus_timeout_ms must be positive"));
    }
    Ok(())
}

// Names end up in SCM calls and device paths.
fn is_safe_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 256
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;
    use tempfile::{NamedTempFile, TempDir};

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Ring0Config::default();
        assert_eq!(cfg.driver_id, "WinRing0_1_2_0");
        assert_eq!(cfg.bus_timeout(), Duration::from_millis(10));
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "service_name": "probe_tool", "bus_timeout_ms": 25 }}"#).unwrap();
        let cfg = load_config_from(file.path()).unwrap();
        assert_eq!(cfg.service_name(), "probe_tool");
        assert_eq!(cfg.bus_timeout_ms, 25);
        assert_eq!(cfg.extract_timeout_ms, 2000);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg, Ring0Config::default());
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(load_config_from(file.path()), Err(ProbeError::JsonParse(_))));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "drvier_id": "x" }}"#).unwrap();
        assert!(load_config_from(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg = Ring0Config { driver_id: String::new(), ..Default::default() };
        assert!(matches!(validate_config(&cfg), Err(ProbeError::Config(_))));

        let cfg = Ring0Config { service_name: Some("bad\\name".into()), ..Default::default() };
        assert!(validate_config(&cfg).is_err());

        let cfg = Ring0Config { bus_timeout_ms: 0, ..Default::default() };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_driver_image_uses_package_dir() {
        let cfg = Ring0Config {
            driver_package_dir: Some(PathBuf::from("/opt/hwprobe")),
            ..Default::default()
        };
        let DriverImage::Package(path) = cfg.driver_image() else {
            panic!("expected a package image");
        };
        assert!(path.starts_with("/opt/hwprobe"));
        assert!(path.to_string_lossy().ends_with(".sys.gz"));
    }

    #[test]
    #[serial]
    fn test_config_path_env_override() {
        env::set_var(CONFIG_ENV, "/custom/hwprobe.json");
        assert_eq!(config_path(), PathBuf::from("/custom/hwprobe.json"));
        env::remove_var(CONFIG_ENV);
    }

    #[test]
    #[serial]
    fn test_config_path_with_xdg() {
        env::remove_var(CONFIG_ENV);
        env::set_var("XDG_CONFIG_HOME", "/custom/config");
        let path = config_path();
        assert_eq!(path, PathBuf::from("/custom/config/hwprobe/config.json"));
        env::remove_var("XDG_CONFIG_HOME");
    }

    #[test]
    #[serial]
    fn test_config_path_with_home() {
        env::remove_var(CONFIG_ENV);
        let xdg = env::var_os("XDG_CONFIG_HOME");
        let home = env::var_os("HOME");
        env::remove_var("XDG_CONFIG_HOME");
        env::set_var("HOME", "/home/testuser");
        assert_eq!(config_path(), PathBuf::from("/home/testuser/.config/hwprobe/config.json"));
        match home {
            Some(h) => env::set_var("HOME", h),
            None => env::remove_var("HOME"),
        }
        if let Some(x) = xdg {
            env::set_var("XDG_CONFIG_HOME", x);
        }
    }

    #[test]
    fn test_system_config_path() {
        assert_eq!(system_config_path(), PathBuf::from("/etc/hwprobe/config.json"));
    }
}
