use crate::schema::MIG_0001_INIT;
use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction};
use tracing::debug;

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open_or_create(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).with_context(|| format!("open {}", path.display()))?;
        apply_pragmas(&conn)?;
        migrate(&conn)?;
        debug!(path = %path.display(), "opened database");
        Ok(Db { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Db { conn })
    }

    /// Open the single transaction every store operation runs in.
    ///
    /// Operations composed of several store calls take the same handle;
    /// nothing below this opens a transaction of its own.
    pub fn begin(&mut self) -> Result<StoreTx<'_>> {
        let tx = self.conn.transaction().context("begin transaction")?;
        Ok(StoreTx { tx })
    }
}

/// Scoped transaction handle. Dropping it without `commit` rolls back.
pub struct StoreTx<'c> {
    pub(crate) tx: Transaction<'c>,
}

impl StoreTx<'_> {
    pub fn commit(self) -> Result<()> {
        self.tx.commit().context("commit transaction")
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIG_0001_INIT).context("apply schema")?;
    Ok(())
}
