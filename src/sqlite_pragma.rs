//! SQLite connection tuning shared by every writer

use rusqlite::Connection;
use std::time::Duration;

/// WAL journal, relaxed fsync, in-memory temp tables, bounded WAL growth
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.busy_timeout(Duration::from_secs(5))?;

    log::debug!("📊 Applied SQLite pragmas (WAL, NORMAL, MEMORY, autocheckpoint=1000)");
    Ok(())
}
