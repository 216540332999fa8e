//! SQLite adapter for the favicon store
//!
//! One connection, owned by the sync thread. Statements are prepared through
//! the connection's statement cache, so the adapter owns the statement fleet
//! and callers never touch SQL directly.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use thiserror::Error;
use tracing::warn;

use crate::models::IconSnapshot;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("import aborted")]
    ImportAborted,
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Bumped when the table shapes change; a mismatch truncates the store.
const SCHEMA_VERSION: i64 = 6;

const IMPORTED_KEY: &str = "LegacyImported";

/// One `(pageURL, iconURL, stamp)` mapping, as read by the URL import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRow {
    pub page_url: String,
    pub icon_url: String,
    pub stamp: i64,
}

/// Single-connection SQLite store.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
        ",
        )?;
        let db = Self { conn };
        db.setup_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.setup_schema()?;
        Ok(db)
    }

    fn setup_schema(&self) -> DatabaseResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS PageURL (
                url TEXT PRIMARY KEY,
                iconID INTEGER
            );

            CREATE TABLE IF NOT EXISTS IconInfo (
                iconID INTEGER PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                stamp INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS IconData (
                iconID INTEGER PRIMARY KEY,
                data BLOB
            );

            CREATE TABLE IF NOT EXISTS IconDatabaseInfo (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
        )?;

        match self.version()? {
            Some(version) if version == SCHEMA_VERSION => {}
            Some(version) => {
                warn!(
                    "icon database version {} does not match {}, truncating",
                    version, SCHEMA_VERSION
                );
                self.truncate_all()?;
                self.set_version(SCHEMA_VERSION)?;
            }
            None => self.set_version(SCHEMA_VERSION)?,
        }
        Ok(())
    }

    fn version(&self) -> DatabaseResult<Option<i64>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM IconDatabaseInfo WHERE key = 'Version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    fn set_version(&self, version: i64) -> DatabaseResult<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR REPLACE INTO IconDatabaseInfo (key, value) VALUES ('Version', ?1)",
        )?;
        stmt.execute([version.to_string()])?;
        Ok(())
    }

    /// Begin a deferred transaction on the sync thread's connection.
    pub fn transaction(&self) -> DatabaseResult<Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    /// Upsert the page row, pointing it at the given icon id (or none).
    pub fn set_icon_id_for_page(&self, page_url: &str, icon_id: Option<i64>) -> DatabaseResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT OR REPLACE INTO PageURL (url, iconID) VALUES (?1, ?2)")?;
        stmt.execute(params![page_url, icon_id])?;
        Ok(())
    }

    pub fn remove_page(&self, page_url: &str) -> DatabaseResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM PageURL WHERE url = ?1")?;
        stmt.execute([page_url])?;
        Ok(())
    }

    pub fn icon_id_for_icon_url(&self, icon_url: &str) -> DatabaseResult<Option<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT iconID FROM IconInfo WHERE url = ?1")?;
        Ok(stmt.query_row([icon_url], |row| row.get(0)).optional()?)
    }

    /// Insert a fresh icon row with no stamp; returns its id.
    pub fn add_icon_url(&self, icon_url: &str) -> DatabaseResult<i64> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO IconInfo (url, stamp) VALUES (?1, 0)")?;
        stmt.execute([icon_url])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Bytes for an icon, or None when the row is absent or holds a
    /// "no icon known" NULL.
    pub fn image_data_for_icon_url(&self, icon_url: &str) -> DatabaseResult<Option<Vec<u8>>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT IconData.data FROM IconData
             INNER JOIN IconInfo ON IconData.iconID = IconInfo.iconID
             WHERE IconInfo.url = ?1",
        )?;
        let data: Option<Option<Vec<u8>>> = stmt
            .query_row([icon_url], |row| row.get::<_, Option<Vec<u8>>>(0))
            .optional()?;
        Ok(data.flatten())
    }

    /// Remove the icon's info and data rows; pages referencing it are left
    /// in place with their iconID set to NULL.
    pub fn remove_icon(&self, icon_url: &str) -> DatabaseResult<()> {
        let Some(icon_id) = self.icon_id_for_icon_url(icon_url)? else {
            return Ok(());
        };
        let mut clear_pages = self
            .conn
            .prepare_cached("UPDATE PageURL SET iconID = NULL WHERE iconID = ?1")?;
        clear_pages.execute([icon_id])?;
        let mut delete_info = self
            .conn
            .prepare_cached("DELETE FROM IconInfo WHERE iconID = ?1")?;
        delete_info.execute([icon_id])?;
        let mut delete_data = self
            .conn
            .prepare_cached("DELETE FROM IconData WHERE iconID = ?1")?;
        delete_data.execute([icon_id])?;
        Ok(())
    }

    /// Apply one icon snapshot: upsert into the info and data tables, or
    /// cascade-delete for a tombstone.
    pub fn write_icon_snapshot(&self, snapshot: &IconSnapshot) -> DatabaseResult<()> {
        match snapshot {
            IconSnapshot::Delete { icon_url } => self.remove_icon(icon_url),
            IconSnapshot::Update {
                icon_url,
                timestamp,
                data,
            } => {
                let icon_id = match self.icon_id_for_icon_url(icon_url)? {
                    Some(icon_id) => {
                        let mut stmt = self
                            .conn
                            .prepare_cached("UPDATE IconInfo SET stamp = ?1 WHERE iconID = ?2")?;
                        stmt.execute(params![timestamp, icon_id])?;
                        icon_id
                    }
                    None => {
                        let mut stmt = self
                            .conn
                            .prepare_cached("INSERT INTO IconInfo (url, stamp) VALUES (?1, ?2)")?;
                        stmt.execute(params![icon_url, timestamp])?;
                        self.conn.last_insert_rowid()
                    }
                };
                let mut stmt = self
                    .conn
                    .prepare_cached("INSERT OR REPLACE INTO IconData (iconID, data) VALUES (?1, ?2)")?;
                stmt.execute(params![icon_id, data.as_ref().map(|d| d.as_slice())])?;
                Ok(())
            }
        }
    }

    pub fn imported_flag(&self) -> DatabaseResult<Option<bool>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value FROM IconDatabaseInfo WHERE key = ?1")?;
        let value: Option<String> = stmt.query_row([IMPORTED_KEY], |row| row.get(0)).optional()?;
        Ok(value.map(|v| v == "1"))
    }

    pub fn set_imported_flag(&self, imported: bool) -> DatabaseResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT OR REPLACE INTO IconDatabaseInfo (key, value) VALUES (?1, ?2)")?;
        stmt.execute(params![IMPORTED_KEY, if imported { "1" } else { "0" }])?;
        Ok(())
    }

    /// Delete every page, icon and data row, then vacuum so the file returns
    /// to its empty-schema size. The info table (version, imported flag)
    /// survives.
    pub fn truncate_all(&self) -> DatabaseResult<()> {
        let tx = self.transaction()?;
        self.conn.execute("DELETE FROM PageURL", [])?;
        self.conn.execute("DELETE FROM IconInfo", [])?;
        self.conn.execute("DELETE FROM IconData", [])?;
        tx.commit()?;
        self.conn.execute_batch("VACUUM;")?;
        Ok(())
    }

    pub fn integrity_check(&self) -> bool {
        match self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0))
        {
            Ok(result) => result == "ok",
            Err(err) => {
                warn!("integrity check could not run: {}", err);
                false
            }
        }
    }

    /// Every `(pageURL, iconURL, stamp)` mapping on disk, for the URL import.
    pub fn page_rows(&self) -> DatabaseResult<Vec<PageRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT PageURL.url, IconInfo.url, IconInfo.stamp FROM PageURL
             INNER JOIN IconInfo ON PageURL.iconID = IconInfo.iconID",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PageRow {
                    page_url: row.get(0)?,
                    icon_url: row.get(1)?,
                    stamp: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every page URL with a row on disk, for pruning.
    pub fn page_urls_on_disk(&self) -> DatabaseResult<Vec<String>> {
        let mut stmt = self.conn.prepare_cached("SELECT url FROM PageURL")?;
        let urls = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(urls)
    }

    /// Delete every icon row with no referring page row. Returns how many
    /// icons were removed.
    pub fn remove_unreferenced_icons(&self) -> DatabaseResult<usize> {
        self.conn.execute(
            "DELETE FROM IconData WHERE iconID NOT IN
                 (SELECT iconID FROM PageURL WHERE iconID IS NOT NULL)",
            [],
        )?;
        let removed = self.conn.execute(
            "DELETE FROM IconInfo WHERE iconID NOT IN
                 (SELECT iconID FROM PageURL WHERE iconID IS NOT NULL)",
            [],
        )?;
        Ok(removed)
    }

    /// Page URLs whose iconID points at an icon row that no longer exists.
    pub fn dangling_page_urls(&self) -> DatabaseResult<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT url FROM PageURL WHERE iconID IS NOT NULL
             AND iconID NOT IN (SELECT iconID FROM IconInfo)",
        )?;
        let urls = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(urls)
    }

    /// Current size of the database image in bytes.
    pub fn database_size(&self) -> DatabaseResult<i64> {
        let page_count: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(page_count * page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const ICON: &str = "https://example.com/favicon.ico";
    const PAGE: &str = "https://example.com/";

    fn update(icon_url: &str, timestamp: i64, data: Option<Vec<u8>>) -> IconSnapshot {
        IconSnapshot::Update {
            icon_url: icon_url.to_string(),
            timestamp,
            data: data.map(Arc::new),
        }
    }

    #[test]
    fn icon_id_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.icon_id_for_icon_url(ICON).unwrap(), None);
        let id = db.add_icon_url(ICON).unwrap();
        assert_eq!(db.icon_id_for_icon_url(ICON).unwrap(), Some(id));
    }

    #[test]
    fn page_row_upsert_and_remove() {
        let db = Database::open_in_memory().unwrap();
        let id = db.add_icon_url(ICON).unwrap();
        db.set_icon_id_for_page(PAGE, Some(id)).unwrap();

        let rows = db.page_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].page_url, PAGE);
        assert_eq!(rows[0].icon_url, ICON);

        db.remove_page(PAGE).unwrap();
        assert!(db.page_rows().unwrap().is_empty());
    }

    #[test]
    fn icon_snapshot_writes_bytes_and_stamp() {
        let db = Database::open_in_memory().unwrap();
        db.write_icon_snapshot(&update(ICON, 1000, Some(vec![1, 2, 3])))
            .unwrap();
        assert_eq!(db.image_data_for_icon_url(ICON).unwrap(), Some(vec![1, 2, 3]));

        // Overwrite with fresh bytes
        db.write_icon_snapshot(&update(ICON, 2000, Some(vec![4])))
            .unwrap();
        assert_eq!(db.image_data_for_icon_url(ICON).unwrap(), Some(vec![4]));
        let rows_stamp: i64 = {
            let id = db.icon_id_for_icon_url(ICON).unwrap().unwrap();
            db.conn
                .query_row(
                    "SELECT stamp FROM IconInfo WHERE iconID = ?1",
                    [id],
                    |row| row.get(0),
                )
                .unwrap()
        };
        assert_eq!(rows_stamp, 2000);
    }

    #[test]
    fn null_data_snapshot_overwrites_existing_bytes() {
        let db = Database::open_in_memory().unwrap();
        db.write_icon_snapshot(&update(ICON, 1000, Some(vec![1])))
            .unwrap();
        db.write_icon_snapshot(&update(ICON, 2000, None)).unwrap();
        // Row exists, bytes are gone
        assert!(db.icon_id_for_icon_url(ICON).unwrap().is_some());
        assert_eq!(db.image_data_for_icon_url(ICON).unwrap(), None);
    }

    #[test]
    fn delete_snapshot_nulls_page_references() {
        let db = Database::open_in_memory().unwrap();
        db.write_icon_snapshot(&update(ICON, 1000, Some(vec![1])))
            .unwrap();
        let id = db.icon_id_for_icon_url(ICON).unwrap().unwrap();
        db.set_icon_id_for_page(PAGE, Some(id)).unwrap();

        db.write_icon_snapshot(&IconSnapshot::Delete {
            icon_url: ICON.to_string(),
        })
        .unwrap();

        assert_eq!(db.icon_id_for_icon_url(ICON).unwrap(), None);
        // Page row survives with a NULL icon reference
        assert_eq!(db.page_urls_on_disk().unwrap(), vec![PAGE.to_string()]);
        assert!(db.page_rows().unwrap().is_empty());
    }

    #[test]
    fn imported_flag_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.imported_flag().unwrap(), None);
        db.set_imported_flag(true).unwrap();
        assert_eq!(db.imported_flag().unwrap(), Some(true));
        db.set_imported_flag(false).unwrap();
        assert_eq!(db.imported_flag().unwrap(), Some(false));
    }

    #[test]
    fn unreferenced_icons_are_removed() {
        let db = Database::open_in_memory().unwrap();
        db.write_icon_snapshot(&update(ICON, 1, Some(vec![1]))).unwrap();
        db.write_icon_snapshot(&update("https://other.example/i.png", 1, Some(vec![2])))
            .unwrap();
        let id = db.icon_id_for_icon_url(ICON).unwrap().unwrap();
        db.set_icon_id_for_page(PAGE, Some(id)).unwrap();

        let removed = db.remove_unreferenced_icons().unwrap();
        assert_eq!(removed, 1);
        assert!(db.icon_id_for_icon_url(ICON).unwrap().is_some());
        assert!(db
            .icon_id_for_icon_url("https://other.example/i.png")
            .unwrap()
            .is_none());
    }

    #[test]
    fn dangling_pages_are_reported() {
        let db = Database::open_in_memory().unwrap();
        db.set_icon_id_for_page(PAGE, Some(12345)).unwrap();
        assert_eq!(db.dangling_page_urls().unwrap(), vec![PAGE.to_string()]);
    }

    #[test]
    fn truncate_clears_mappings_but_keeps_info() {
        let db = Database::open_in_memory().unwrap();
        db.set_imported_flag(true).unwrap();
        db.write_icon_snapshot(&update(ICON, 1, Some(vec![1]))).unwrap();
        let id = db.icon_id_for_icon_url(ICON).unwrap().unwrap();
        db.set_icon_id_for_page(PAGE, Some(id)).unwrap();

        db.truncate_all().unwrap();

        assert!(db.page_urls_on_disk().unwrap().is_empty());
        assert_eq!(db.icon_id_for_icon_url(ICON).unwrap(), None);
        assert_eq!(db.imported_flag().unwrap(), Some(true));
    }

    #[test]
    fn integrity_check_passes_on_fresh_store() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.integrity_check());
    }

    #[test]
    fn version_mismatch_truncates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("icons.db");
        {
            let db = Database::open(&path).unwrap();
            db.write_icon_snapshot(&update(ICON, 1, Some(vec![1]))).unwrap();
            db.set_version(1).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.icon_id_for_icon_url(ICON).unwrap(), None);
        assert_eq!(db.version().unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn large_blob_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let big = vec![0xabu8; 300 * 1024];
        db.write_icon_snapshot(&update(ICON, 1, Some(big.clone())))
            .unwrap();
        assert_eq!(db.image_data_for_icon_url(ICON).unwrap(), Some(big));
    }
}
