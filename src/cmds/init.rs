// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

/// Initializes the catalog database.
#[derive(Bpaf, Debug)]
pub struct Args {
    #[bpaf(external(crate::parse_db_path))]
    db: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let mut conn = super::open_conn(&args.db, super::OpenMode::Create)?;

    if let Some(v) = db::schema::get_version(&conn)? {
        info!("Database is already initialized with schema version {v}.");
        return Ok(0);
    }

    // Use WAL mode (the most efficient way to preserve database integrity)
    // with a larger page size. Changing the page size requires a vacuum in
    // non-WAL mode, which is cheap on an empty database.
    conn.execute_batch(
        r#"
        pragma journal_mode = delete;
        pragma page_size = 16384;
        vacuum;
        pragma journal_mode = wal;
        "#,
    )
    .map_err(Error::from)?;
    db::schema::init(&mut conn)?;
    info!("Database initialized.");
    Ok(0)
}
