use std::path::Path;

use anyhow::Context;
use clap::Parser;
use repl_client::{Result as ReplResult, SegmentHook, WalStreamEngine, WalStreamOptions};
use tracing::info;

use pg_receivewal_rs::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(err) = run(args).await {
        eprintln!("pg_receivewal_rs: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.dir)
        .with_context(|| format!("creating {}", args.dir.display()))?;

    let (client, connection) = args
        .pg_config()
        .connect(tokio_postgres::NoTls)
        .await
        .context("connecting to server")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "replication connection closed with error");
        }
    });

    let identity = repl_client::identify_system(&client)
        .await
        .context("IDENTIFY_SYSTEM")?;
    info!(
        systemid = %identity.systemid,
        timeline = identity.timeline,
        xlogpos = %identity.xlogpos,
        "identified server"
    );

    let mut engine = WalStreamEngine::new(
        WalStreamOptions {
            dir: args.dir.clone(),
            seg_sz: postgres_ffi::DEFAULT_WAL_SEGMENT_SIZE,
            timeline: identity.timeline,
        },
        LoggingHook,
    );

    let resume_lsn = engine
        .discover_resume_position(identity.xlogpos)
        .context("scanning WAL directory for resume position")?;
    info!(%resume_lsn, "resuming WAL streaming");

    let stopped_at = engine
        .run(&client, resume_lsn)
        .await
        .context("streaming WAL")?;
    info!(%stopped_at, "stream ended");
    Ok(())
}

/// Logs each completed segment. The stale `.partial` predecessor of a
/// resumed segment is cleaned up inside the engine itself (discovery
/// renames it into place, and opening that same segment fresh removes it),
/// so this hook has nothing left to do by the time a segment completes.
struct LoggingHook;

impl SegmentHook for LoggingHook {
    fn on_segment_complete(&mut self, segment_path: &Path) -> ReplResult<()> {
        info!(path = %segment_path.display(), "segment complete");
        Ok(())
    }
}
