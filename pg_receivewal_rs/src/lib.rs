//! CLI configuration for the WAL receiver binary (spec §6).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "pg_receivewal_rs", about = "Stream WAL segments to a local directory")]
pub struct Args {
    /// Directory to write segment files into.
    #[arg(long)]
    pub dir: PathBuf,

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

impl Args {
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
