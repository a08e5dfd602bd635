// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Database access logic for the LightNVR SQLite schema.
//!
//! All access goes through [`Database`], which serializes callers on a single
//! connection. Transactions are short by design: stream recorders call into
//! here from their per-frame-free paths only (segment boundaries), but the
//! lock is shared by every recorder plus the supervisor, so nothing here may
//! block on I/O other than SQLite itself.

use std::path::{Path, PathBuf};

use base::{bail, err, Error};
use rusqlite::{named_params, params};

use crate::schema;

const INSERT_RECORDING_SQL: &str = r#"
    insert into recordings (stream_name,  file_path,  start_time,  end_time,  size_bytes,  is_complete)
                    values (:stream_name, :file_path, :start_time, :end_time, :size_bytes, :is_complete)
"#;

const UPDATE_RECORDING_SQL: &str = r#"
    update recordings
    set end_time = case when :end_time = 0 then end_time else :end_time end,
        size_bytes = :size_bytes,
        is_complete = is_complete or :mark_complete
    where id = :id
"#;

const GET_RECORDING_SQL: &str = r#"
    select id, stream_name, file_path, start_time, end_time, size_bytes, is_complete
    from recordings where id = :id
"#;

const LIST_RECORDINGS_SQL: &str = r#"
    select id, stream_name, file_path, start_time, end_time, size_bytes, is_complete
    from recordings where stream_name = :stream_name order by start_time, id
"#;

const LIST_OPEN_RECORDINGS_SQL: &str = r#"
    select id, stream_name, file_path, start_time, end_time, size_bytes, is_complete
    from recordings where is_complete = 0 order by stream_name, id
"#;

const LIST_ENDING_BEFORE_SQL: &str = r#"
    select id, stream_name, file_path, start_time, end_time, size_bytes, is_complete
    from recordings where is_complete = 1 and end_time < :cutoff order by end_time, id
"#;

const OLDEST_COMPLETE_SQL: &str = r#"
    select id, stream_name, file_path, start_time, end_time, size_bytes, is_complete
    from recordings where is_complete = 1 order by start_time, id limit 1
"#;

const GET_STREAM_SQL: &str = r#"
    select name, url, segment_duration, record_audio, enabled, output_dir
    from streams where name = :name
"#;

const LIST_STREAMS_SQL: &str = r#"
    select name, url, segment_duration, record_audio, enabled, output_dir
    from streams order by name
"#;

const UPSERT_STREAM_SQL: &str = r#"
    insert into streams (name,  url,  segment_duration,  record_audio,  enabled,  output_dir)
                 values (:name, :url, :segment_duration, :record_audio, :enabled, :output_dir)
    on conflict (name) do update
    set url = :url, segment_duration = :segment_duration, record_audio = :record_audio,
        enabled = :enabled, output_dir = :output_dir
"#;

/// Per-stream configuration, read by recorders at segment boundaries and
/// written only through the admin path (`lightnvr streams …`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub url: String,
    pub segment_duration: u32,
    pub record_audio: bool,
    pub enabled: bool,
    pub output_dir: PathBuf,
}

/// A catalog row describing one recording file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recording {
    pub id: i64,
    pub stream_name: String,
    pub file_path: PathBuf,
    /// Wall-clock seconds since epoch; 0 in `end_time` means still open.
    pub start_time: i64,
    pub end_time: i64,
    pub size_bytes: i64,
    pub is_complete: bool,
}

fn path_str(path: &Path) -> Result<&str, Error> {
    path.to_str()
        .ok_or_else(|| err!(InvalidArgument, msg("non-UTF-8 path {:?}", path)))
}

fn row_to_recording(row: &rusqlite::Row) -> rusqlite::Result<Recording> {
    Ok(Recording {
        id: row.get(0)?,
        stream_name: row.get(1)?,
        file_path: PathBuf::from(row.get::<_, String>(2)?),
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        size_bytes: row.get(5)?,
        is_complete: row.get(6)?,
    })
}

fn row_to_stream_config(row: &rusqlite::Row) -> rusqlite::Result<StreamConfig> {
    Ok(StreamConfig {
        name: row.get(0)?,
        url: row.get(1)?,
        segment_duration: row.get(2)?,
        record_audio: row.get(3)?,
        enabled: row.get(4)?,
        output_dir: PathBuf::from(row.get::<_, String>(5)?),
    })
}

/// The recording catalog. Shared by all stream recorders and the supervisor.
pub struct Database {
    conn: base::Mutex<rusqlite::Connection>,
}

impl Database {
    /// Wraps an open connection, verifying the schema version.
    pub fn new(conn: rusqlite::Connection) -> Result<Self, Error> {
        schema::check_version(&conn)?;
        conn.execute_batch("pragma foreign_keys = on")?;
        tracing::debug!(
            "catalog open, schema version {}, SQLite {}",
            schema::EXPECTED_VERSION,
            rusqlite::version()
        );
        Ok(Database {
            conn: base::Mutex::new(conn),
        })
    }

    /// Atomically inserts an open row for a new recording file and returns
    /// its id.
    pub fn begin_recording(
        &self,
        stream_name: &str,
        file_path: &Path,
        start_time: i64,
    ) -> Result<i64, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(INSERT_RECORDING_SQL)?;
        stmt.execute(named_params! {
            ":stream_name": stream_name,
            ":file_path": path_str(file_path)?,
            ":start_time": start_time,
            ":end_time": 0i64,
            ":size_bytes": 0i64,
            ":is_complete": false,
        })?;
        Ok(conn.last_insert_rowid())
    }

    /// Partially updates a recording row.
    ///
    /// `end_time` 0 leaves the stored end time unchanged. Sealing
    /// (`mark_complete`) is idempotent: a row already complete stays complete
    /// regardless of the flag, and applying the same seal twice yields the
    /// same row state.
    pub fn update_recording(
        &self,
        id: i64,
        end_time: i64,
        size_bytes: i64,
        mark_complete: bool,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(UPDATE_RECORDING_SQL)?;
        let rows = stmt.execute(named_params! {
            ":id": id,
            ":end_time": end_time,
            ":size_bytes": size_bytes,
            ":mark_complete": mark_complete,
        })?;
        if rows != 1 {
            bail!(NotFound, msg("no recording row with id {id}"));
        }
        Ok(())
    }

    /// Inserts an already-sealed row, used when adopting an untracked file
    /// found on disk.
    pub fn insert_complete_recording(
        &self,
        stream_name: &str,
        file_path: &Path,
        start_time: i64,
        end_time: i64,
        size_bytes: i64,
    ) -> Result<i64, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(INSERT_RECORDING_SQL)?;
        stmt.execute(named_params! {
            ":stream_name": stream_name,
            ":file_path": path_str(file_path)?,
            ":start_time": start_time,
            ":end_time": end_time,
            ":size_bytes": size_bytes,
            ":is_complete": true,
        })?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_recording(&self, id: i64) -> Result<Recording, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(GET_RECORDING_SQL)?;
        Ok(stmt.query_row(named_params! {":id": id}, row_to_recording)?)
    }

    pub fn delete_recording(&self, id: i64) -> Result<(), Error> {
        let conn = self.conn.lock();
        let rows = conn.execute("delete from recordings where id = ?1", params![id])?;
        if rows != 1 {
            bail!(NotFound, msg("no recording row with id {id}"));
        }
        Ok(())
    }

    pub fn list_recordings(&self, stream_name: &str) -> Result<Vec<Recording>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(LIST_RECORDINGS_SQL)?;
        let rows = stmt.query_map(named_params! {":stream_name": stream_name}, row_to_recording)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Lists open rows across all streams, for the startup sweep.
    pub fn list_open_recordings(&self) -> Result<Vec<Recording>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(LIST_OPEN_RECORDINGS_SQL)?;
        let rows = stmt.query_map([], row_to_recording)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Lists sealed recordings whose end time precedes `cutoff`, oldest
    /// first, for retention.
    pub fn list_recordings_ending_before(&self, cutoff: i64) -> Result<Vec<Recording>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(LIST_ENDING_BEFORE_SQL)?;
        let rows = stmt.query_map(named_params! {":cutoff": cutoff}, row_to_recording)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn oldest_complete_recording(&self) -> Result<Option<Recording>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(OLDEST_COMPLETE_SQL)?;
        match stmt.query_row([], row_to_recording) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Total bytes tracked by the catalog, open rows included.
    pub fn total_recorded_bytes(&self) -> Result<i64, Error> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "select coalesce(sum(size_bytes), 0) from recordings",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn contains_file_path(&self, path: &Path) -> Result<bool, Error> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "select exists (select 1 from recordings where file_path = ?1)",
            params![path_str(path)?],
            |row| row.get(0),
        )?)
    }

    /// Reads a stream's current configuration; `None` if the stream row is
    /// gone.
    pub fn get_stream_config(&self, name: &str) -> Result<Option<StreamConfig>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(GET_STREAM_SQL)?;
        match stmt.query_row(named_params! {":name": name}, row_to_stream_config) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_stream_configs(&self) -> Result<Vec<StreamConfig>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(LIST_STREAMS_SQL)?;
        let rows = stmt.query_map([], row_to_stream_config)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Inserts or replaces a stream row. The admin path; never called by
    /// recorders.
    pub fn upsert_stream(&self, config: &StreamConfig) -> Result<(), Error> {
        if config.name.is_empty() || config.name.len() > 64 {
            bail!(
                InvalidArgument,
                msg("stream name must be 1-64 characters, got {:?}", config.name)
            );
        }
        if config.segment_duration < 1 {
            bail!(InvalidArgument, msg("segment_duration must be >= 1"));
        }
        if !config.output_dir.is_absolute() {
            bail!(
                InvalidArgument,
                msg("output_dir must be absolute, got {:?}", config.output_dir)
            );
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(UPSERT_STREAM_SQL)?;
        stmt.execute(named_params! {
            ":name": config.name,
            ":url": config.url,
            ":segment_duration": config.segment_duration,
            ":record_audio": config.record_audio,
            ":enabled": config.enabled,
            ":output_dir": path_str(&config.output_dir)?,
        })?;
        Ok(())
    }

    pub fn set_stream_enabled(&self, name: &str, enabled: bool) -> Result<(), Error> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "update streams set enabled = ?2 where name = ?1",
            params![name, enabled],
        )?;
        if rows != 1 {
            bail!(NotFound, msg("no stream named {name:?}"));
        }
        Ok(())
    }

    /// Removes a stream row. Fails while recordings still reference it.
    pub fn remove_stream(&self, name: &str) -> Result<(), Error> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("delete from streams where name = ?1", params![name])
            .map_err(|e| {
                err!(
                    FailedPrecondition,
                    msg("can't remove stream {name:?} (recordings may still reference it)"),
                    source(e)
                )
            })?;
        if rows != 1 {
            bail!(NotFound, msg("no stream named {name:?}"));
        }
        Ok(())
    }
}
