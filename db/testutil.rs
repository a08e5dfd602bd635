// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Test support: an in-memory catalog plus a scratch directory for sample
//! files.

use std::sync::Arc;

use crate::db::{Database, StreamConfig};
use crate::schema;

/// Performs global initialization for tests (logging). Idempotent.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(base::tracing_setup::install_for_tests);
}

pub struct TestDb {
    pub db: Arc<Database>,
    pub tmpdir: tempfile::TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        init();
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        schema::init(&mut conn).unwrap();
        TestDb {
            db: Arc::new(Database::new(conn).unwrap()),
            tmpdir: tempfile::Builder::new()
                .prefix("lightnvr-test")
                .tempdir()
                .unwrap(),
        }
    }

    /// Adds an enabled stream whose output directory lives under the scratch
    /// dir, returning its configuration.
    pub fn add_test_stream(&self, name: &str) -> StreamConfig {
        let output_dir = self.tmpdir.path().join(name);
        std::fs::create_dir_all(&output_dir).unwrap();
        let config = StreamConfig {
            name: name.to_owned(),
            url: format!("rtsp://test-camera/{name}"),
            segment_duration: 30,
            record_audio: true,
            enabled: true,
            output_dir,
        };
        self.db.upsert_stream(&config).unwrap();
        config
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}
