// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base::clock::RealClocks;
use base::shutdown::Coordinator;
use base::{bail, err, Error};
use bpaf::Bpaf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::mp4;
use crate::stream;
use crate::supervisor::{RetentionConfig, Supervisor};

use self::config::ConfigFile;

mod config;

/// Runs the recorder until SIGINT or SIGTERM.
#[derive(Bpaf, Debug)]
pub struct Args {
    /// Path to the runtime configuration file.
    #[bpaf(
        long,
        argument("PATH"),
        fallback("/etc/lightnvr.toml".into()),
        debug_fallback
    )]
    config: PathBuf,
}

fn read_config(path: &Path) -> Result<ConfigFile, Error> {
    let config = std::fs::read_to_string(path)
        .map_err(|e| err!(NotFound, msg("unable to read {}", path.display()), source(e)))?;
    let config = toml::from_str(&config)
        .map_err(|e| err!(InvalidArgument, msg("unable to parse {}", path.display()), source(e)))?;
    Ok(config)
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = read_config(&args.config)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = config.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let rt = builder.build().map_err(Error::from)?;
    let r = rt.block_on(async_run(&config));

    // tokio normally waits for all spawned tasks to complete, but:
    // * in the graceful shutdown path, the supervisor has already waited on
    //   its workers with a deadline and deliberately detached the laggards.
    // * in the immediate shutdown path, we don't want to wait.
    rt.shutdown_background();

    r
}

async fn async_run(config: &ConfigFile) -> Result<i32, Error> {
    let coordinator = Coordinator::new();

    let mut int = signal(SignalKind::interrupt()).map_err(Error::from)?;
    let mut term = signal(SignalKind::terminate()).map_err(Error::from)?;
    tokio::pin! {
        let inner = inner(config, coordinator.clone());
    }

    tokio::select! {
        _ = int.recv() => {
            info!("Received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            coordinator.initiate_shutdown();
        },
        _ = term.recv() => {
            info!("Received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            coordinator.initiate_shutdown();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result,
    }
}

async fn inner(config: &ConfigFile, coordinator: Coordinator) -> Result<i32, Error> {
    let conn = super::open_conn(&config.db_path, super::OpenMode::ReadWrite)?;
    let db = Arc::new(db::Database::new(conn)?);
    info!("Database is loaded.");

    let retention = RetentionConfig {
        max_storage_gb: config.max_storage_gb,
        retention_days: config.retention_days,
        auto_delete_oldest: config.auto_delete_oldest,
    };
    let mux = mp4::MuxOptions {
        write_seek_index: config.write_seek_index,
    };
    // Construct on the async runtime so recorder threads inherit its handle.
    let mut supervisor = Supervisor::new(
        RealClocks {},
        db,
        Arc::new(stream::OPENER),
        coordinator.clone(),
        retention,
        mux,
    );
    info!("Ready to record.");
    tokio::task::spawn_blocking(move || supervisor.run())
        .await
        .map_err(|e| err!(Internal, msg("supervisor thread failed"), source(e)))?;
    info!("Exiting.");
    Ok(0)
}
