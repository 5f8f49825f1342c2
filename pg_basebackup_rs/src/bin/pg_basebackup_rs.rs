use std::io::IsTerminal;

use anyhow::Context;
use clap::Parser;
use repl_client::{BackupTarget as EngineTarget, BaseBackupEngine, BaseBackupOptions};

use pg_basebackup_rs::{Args, Target};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(err) = run(args).await {
        eprintln!("pg_basebackup_rs: {err:#}");
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
    let target = args.target()?;

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

    let progress = Progress::new(args.progress);
    progress.start("starting base backup");

    let engine_target = match target {
        Target::Tree(dir) => EngineTarget::Tree { target_dir: dir },
        Target::Tar {
            out_dir,
            gzip_level,
        } => EngineTarget::Tar {
            out_dir,
            gzip_level,
        },
    };

    let options = BaseBackupOptions {
        label: args.label.clone(),
        progress: args.progress,
        fast: false,
        nowait: false,
        include_wal: false,
    };

    let engine = BaseBackupEngine::new(&TokioPostgresConnection(&client), options);
    let tablespaces = engine.run(engine_target).await?;
    progress.finish(&format!(
        "base backup complete ({} tablespace(s))",
        tablespaces.len()
    ));
    Ok(())
}

/// Wraps the real connection in the `BaseBackupConnection` extension point
/// documented in DESIGN.md.
struct TokioPostgresConnection<'a>(&'a tokio_postgres::Client);

#[async_trait::async_trait]
impl<'a> repl_client::BaseBackupConnection for TokioPostgresConnection<'a> {
    async fn base_backup_raw(
        &self,
        command: &str,
    ) -> repl_client::Result<(
        Vec<repl_client::TablespaceDescriptor>,
        Box<dyn repl_client::TablespaceCopyStreams>,
    )> {
        pg_basebackup_rs::connection::base_backup_raw(self.0, command).await
    }
}

struct Progress {
    enabled: bool,
}

impl Progress {
    fn new(requested: bool) -> Self {
        Progress {
            enabled: requested && std::io::stderr().is_terminal(),
        }
    }

    fn start(&self, msg: &str) {
        if self.enabled {
            eprint!("{msg}\r");
        }
    }

    fn finish(&self, msg: &str) {
        if self.enabled {
            eprintln!("{msg}");
        } else {
            tracing::info!("{msg}");
        }
    }
}
