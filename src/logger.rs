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

//! Logging setup for hosts that do not install their own subscriber.
//!
//! The library itself only emits `tracing` events; call [`init_logging`]
//! once at startup to print them.

use std::env;

use crate::constants::paths::LOG_ENV;

const DEFAULT_LEVEL: &str = "info";

/// Filter directive from `$HWPROBE_LOG`, `info` when unset.
pub fn log_level() -> String {
    env::var(LOG_ENV)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LEVEL.to_string())
}

/// Install a stdout subscriber. Returns `false` if one was already set.
pub fn init_logging() -> bool {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(log_level())
        .try_init()
        .is_ok()
}
