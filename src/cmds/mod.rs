// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommands.

use std::path::Path;

use base::{err, Error};
use tracing::info;

pub mod init;
pub mod run;
pub mod streams;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    Create,
}

/// Opens the catalog database.
pub fn open_conn(db_path: &Path, mode: OpenMode) -> Result<rusqlite::Connection, Error> {
    info!(
        "Opening {} in {:?} mode with SQLite version {}",
        db_path.display(),
        mode,
        rusqlite::version()
    );
    let conn = rusqlite::Connection::open_with_flags(
        db_path,
        match mode {
            OpenMode::ReadWrite => rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenMode::Create => {
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            }
        } |
        // rusqlite::Connection is not Sync, so there's no reason to tell
        // SQLite3 to use the serialized threading mode.
        rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| {
        err!(
            Unavailable,
            msg(
                "unable to open {} ({})",
                db_path.display(),
                if mode == OpenMode::Create {
                    "create"
                } else {
                    "try running lightnvr init first"
                }
            ),
            source(e)
        )
    })?;
    Ok(conn)
}
