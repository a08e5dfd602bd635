// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Runtime configuration file (`/etc/lightnvr.toml`).
//!
//! Per-stream configuration lives in the catalog, not here; this file holds
//! only what the process needs before the catalog is open, plus the
//! storage-budget knobs the supervisor enforces.

use std::path::PathBuf;

use serde::Deserialize;

fn default_db_path() -> PathBuf {
    "/var/lib/lightnvr/db.sqlite".into()
}

fn default_true() -> bool {
    true
}

/// Top-level configuration file object.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Path of the SQLite catalog database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// The number of worker threads used by the asynchronous runtime.
    ///
    /// Defaults to the number of cores on the system.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Storage budget across all streams, in GiB. 0 means unlimited.
    #[serde(default)]
    pub max_storage_gb: u64,

    /// Recordings older than this many days are deleted. 0 keeps them
    /// forever.
    #[serde(default)]
    pub retention_days: u32,

    /// Whether exceeding the storage budget deletes the oldest recordings
    /// (rather than merely logging).
    #[serde(default = "default_true")]
    pub auto_delete_oldest: bool,

    /// Whether finished files get a trailing seek index. Finalization is
    /// append-only either way.
    #[serde(default = "default_true")]
    pub write_seek_index: bool,
}
