//! Adapts the neon `tokio-postgres` fork's base-backup extension surface
//! (`Client::base_backup_raw`, `replication::BaseBackupStream` — assumed
//! present on the fork this workspace pins; see DESIGN.md) to
//! `repl_client`'s `BaseBackupConnection`/`TablespaceCopyStreams` traits.

use repl_client::{ReplError, Result as ReplResult, TablespaceCopyStreams, TablespaceDescriptor};
use tokio_postgres::{Client, CopyOutStream};

pub async fn base_backup_raw(
    client: &Client,
    command: &str,
) -> ReplResult<(Vec<TablespaceDescriptor>, Box<dyn TablespaceCopyStreams>)> {
    let (rows, raw) = client
        .base_backup_raw(command)
        .await
        .map_err(ReplError::from)?;

    let tablespaces = rows
        .into_iter()
        .map(|row| TablespaceDescriptor {
            spcoid: row.spcoid.and_then(|s| s.parse().ok()),
            location: row.spclocation,
            size_kb: row.size_kb.map(|v| v as u64),
        })
        .collect();

    Ok((tablespaces, Box::new(RawStreams(raw))))
}

struct RawStreams(tokio_postgres::replication::BaseBackupStream);

#[async_trait::async_trait]
impl TablespaceCopyStreams for RawStreams {
    async fn next_tablespace(&mut self) -> ReplResult<Option<CopyOutStream>> {
        self.0.next_tablespace().await.map_err(ReplError::from)
    }

    async fn finish(self: Box<Self>) -> ReplResult<()> {
        self.0.finish().await.map_err(ReplError::from)
    }
}
