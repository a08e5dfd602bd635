// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The recording catalog: a SQLite-backed metadata store mapping recording
//! ids to on-disk MP4 files, plus the per-stream configuration the stream
//! recorders read.
//!
//! Everything except the actual video samples lives here; the sample data is
//! written directly to the filesystem by the segment writer. The catalog must
//! stay consistent with those files: the supervisor's startup sweep (see the
//! `lightnvr` crate) repairs any divergence left by a crash, using queries
//! exposed by this crate.

mod db;
pub mod schema;
pub mod testutil;

pub use crate::db::{Database, Recording, StreamConfig};
