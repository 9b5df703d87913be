use std::path::Path;

use anyhow::Result;
use tokio_rusqlite::Connection;

pub mod objects;

pub use objects::SqliteStore;

pub async fn init(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).await?;

    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await?;

    Ok(conn)
}
