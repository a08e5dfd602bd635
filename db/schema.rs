// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Schema creation and versioning.

use base::{bail, Error};
use rusqlite::params;

/// Expected schema version. Bump when the schema below changes incompatibly.
pub const EXPECTED_VERSION: i32 = 1;

/// The complete schema. `end_time` is 0 while a recording is open; an open
/// recording has `is_complete` = 0. There is deliberately no uniqueness
/// constraint on open rows per stream: the rotation critical section inserts
/// the new row before sealing the old one, so two open rows briefly coexist.
const SCHEMA: &str = r#"
create table meta (
  schema_version integer not null
);

create table streams (
  name text primary key check (length(name) <= 64),
  url text not null,
  segment_duration integer not null default 30 check (segment_duration >= 1),
  record_audio integer not null default 1,
  enabled integer not null default 1,
  output_dir text not null
) without rowid;

create table recordings (
  id integer primary key autoincrement,
  stream_name text not null references streams (name),
  file_path text unique not null,
  start_time integer not null,
  end_time integer not null default 0,
  size_bytes integer not null default 0,
  is_complete integer not null default 0
);

create index recordings_stream_start on recordings (stream_name, start_time);
"#;

/// Initializes the database schema, failing if it already exists.
pub fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA)?;
    tx.execute(
        "insert into meta (schema_version) values (?1)",
        params![EXPECTED_VERSION],
    )?;
    tx.commit()?;
    Ok(())
}

/// Returns the schema version, or `None` if the database is uninitialized.
pub fn get_version(conn: &rusqlite::Connection) -> Result<Option<i32>, Error> {
    let exists: bool = conn.query_row(
        "select exists (select 1 from sqlite_master where type = 'table' and name = 'meta')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(None);
    }
    Ok(Some(conn.query_row(
        "select schema_version from meta",
        [],
        |row| row.get(0),
    )?))
}

/// Checks that `conn` holds a database of the expected version.
pub fn check_version(conn: &rusqlite::Connection) -> Result<(), Error> {
    match get_version(conn)? {
        None => bail!(
            FailedPrecondition,
            msg("database is uninitialized; run init first")
        ),
        Some(v) if v != EXPECTED_VERSION => bail!(
            FailedPrecondition,
            msg("database has schema version {v}; this binary expects {EXPECTED_VERSION}")
        ),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_and_version() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        assert_eq!(get_version(&conn).unwrap(), None);
        check_version(&conn).unwrap_err();
        init(&mut conn).unwrap();
        assert_eq!(get_version(&conn).unwrap(), Some(EXPECTED_VERSION));
        check_version(&conn).unwrap();
    }

    #[test]
    fn double_init_fails() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        init(&mut conn).unwrap();
        init(&mut conn).unwrap_err();
    }
}
