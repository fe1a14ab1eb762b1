use crate::schema::MIGRATIONS;
use anyhow::Result;
use rusqlite::Connection;

pub struct Db {
    pub conn: Connection,
}

impl Db {
    pub fn open_or_create(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn, true)?;
        migrate(&conn, MIGRATIONS.len())?;
        Ok(Db { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_at(MIGRATIONS.len())
    }

    /// In-memory database with only the first `version` migrations applied.
    pub fn open_in_memory_at(version: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn, false)?;
        migrate(&conn, version)?;
        Ok(Db { conn })
    }

    pub fn schema_version(&self) -> Result<usize> {
        let v: i64 = self.conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        Ok(v as usize)
    }
}

fn apply_pragmas(conn: &Connection, on_disk: bool) -> Result<()> {
    if on_disk {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // concurrent workers contend on the claim statement
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

fn migrate(conn: &Connection, target: usize) -> Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    let target = target.min(MIGRATIONS.len());
    for (idx, sql) in MIGRATIONS.iter().enumerate().take(target).skip(current as usize) {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", (idx + 1) as i64)?;
        tx.commit()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let db = Db::open_in_memory_at(1).unwrap();
        assert_eq!(db.schema_version().unwrap(), 1);
        migrate(&db.conn, MIGRATIONS.len()).unwrap();
        migrate(&db.conn, MIGRATIONS.len()).unwrap();
        assert_eq!(db.schema_version().unwrap(), MIGRATIONS.len());
    }
}
