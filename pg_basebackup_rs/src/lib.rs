//! CLI configuration for the base-backup receiver binary (spec §6).

pub mod connection;

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "pg_basebackup_rs", about = "Receive a PostgreSQL base backup")]
pub struct Args {
    /// Unpack into this directory as a live tree instead of writing tar files.
    #[arg(long, conflicts_with = "tardir")]
    pub basedir: Option<PathBuf>,

    /// Write tar archives into this directory; `-` means stdout.
    #[arg(long)]
    pub tardir: Option<String>,

    /// gzip compression level 0..9 for tar output.
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=9))]
    pub compress: Option<u32>,

    /// BASE_BACKUP label.
    #[arg(long, default_value = "pg_basebackup_rs base backup")]
    pub label: String,

    /// Report progress on stderr.
    #[arg(long)]
    pub progress: bool,

    #[arg(short, long)]
    pub verbose: bool,

    #[arg(long, default_value = "localhost")]
    pub host: String,

    #[arg(long, default_value_t = 5432)]
    pub port: u16,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub no_password: bool,

    #[arg(long)]
    pub password: Option<String>,
}

#[derive(Debug)]
pub enum Target {
    Tree(PathBuf),
    Tar {
        out_dir: Option<PathBuf>,
        gzip_level: Option<u32>,
    },
}

impl Args {
    pub fn target(&self) -> anyhow::Result<Target> {
        match (&self.basedir, &self.tardir) {
            (Some(_), Some(_)) => unreachable!("clap enforces basedir/tardir mutual exclusion"),
            (Some(dir), None) => {
                if self.compress.is_some() {
                    anyhow::bail!("--compress cannot be combined with --basedir (unpack mode)");
                }
                Ok(Target::Tree(dir.clone()))
            }
            (None, Some(dir)) if dir == "-" => {
                if self.compress.is_some() {
                    anyhow::bail!("--compress cannot be combined with stdout output");
                }
                Ok(Target::Tar {
                    out_dir: None,
                    gzip_level: None,
                })
            }
            (None, Some(dir)) => Ok(Target::Tar {
                out_dir: Some(PathBuf::from(dir)),
                gzip_level: self.compress,
            }),
            (None, None) => anyhow::bail!("one of --basedir or --tardir is required"),
        }
    }

    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&self.host).port(self.port);
        if let Some(user) = &self.username {
            cfg.user(user);
        }
        if let Some(password) = &self.password {
            cfg.password(password);
        }
        cfg.replication_mode(tokio_postgres::config::ReplicationMode::Physical);
        cfg
    }
}
