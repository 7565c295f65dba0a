use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::StoreError;
use crate::record::{JobKey, JobRecord};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One named table in one SQLite file, used like a spreadsheet sheet:
/// column order is the header row, rowid order is the row order.
pub struct SheetStore {
    path: PathBuf,
    sheet: String,
}

/// Shape of the persisted sheet.
pub struct SheetInfo {
    pub columns: Vec<String>,
    pub rows: usize,
}

impl SheetStore {
    pub fn new(path: impl Into<PathBuf>, sheet: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            sheet: sheet.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.store_path, &settings.sheet_name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Reads ──

    /// First-column value of every row. Missing store → empty set.
    pub fn existing_keys(&self) -> Result<HashSet<JobKey>, StoreError> {
        self.read(|conn, table| {
            let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY rowid", table))?;
            let mut rows = stmt.query([])?;
            let mut keys = HashSet::new();
            while let Some(row) = rows.next()? {
                if let Some(key) = key_cell(row.get_ref(0)?) {
                    keys.insert(JobKey::new(key));
                }
            }
            Ok(keys)
        })
    }

    /// Every row as a record keyed by the header. Missing store → empty list.
    pub fn records(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.read(|conn, table| {
            let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY rowid", table))?;
            let header: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let rows = stmt
                .query_map([], |row| {
                    header
                        .iter()
                        .enumerate()
                        .map(|(i, name)| Ok((name.clone(), cell_text(row.get_ref(i)?))))
                        .collect::<rusqlite::Result<JobRecord>>()
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn info(&self) -> Result<Option<SheetInfo>, StoreError> {
        self.read(|conn, table| {
            let columns = table_columns(conn, &self.sheet)?;
            let rows: usize =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
            Ok(Some(SheetInfo { columns, rows }))
        })
    }

    /// Open read-only and run `f` against the sheet. Absent file or sheet → `T::default()`.
    fn read<T: Default>(
        &self,
        f: impl FnOnce(&Connection, &str) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        if !self.path.exists() {
            debug!("Store {:?} not found, treating as empty", self.path);
            return Ok(T::default());
        }

        let run = || -> rusqlite::Result<T> {
            let conn = Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            if !table_exists(&conn, &self.sheet)? {
                return Ok(T::default());
            }
            f(&conn, &quote_ident(&self.sheet))
        };
        run().map_err(|e| StoreError::on_open(&self.path, e))
    }

    // ── Writes ──

    /// Append `records` after the last row, in one transaction.
    ///
    /// Columns come from the existing header, or from the first record when the
    /// sheet is new. Fields outside the header are dropped; header columns a
    /// record lacks are written empty.
    pub fn append(&self, records: &[JobRecord]) -> Result<usize, StoreError> {
        let Some(first) = records.first() else {
            return Ok(0);
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(&self.path).map_err(|e| StoreError::on_open(&self.path, e))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::on_open(&self.path, e))?;

        let table = quote_ident(&self.sheet);
        let mut schema = table_columns(&tx, &self.sheet).map_err(|e| StoreError::on_open(&self.path, e))?;
        if schema.is_empty() {
            schema = header_for(first);
            if schema.is_empty() {
                return Err(StoreError::EmptySchema);
            }
            let cols: Vec<String> = schema.iter().map(|c| format!("{} TEXT", quote_ident(c))).collect();
            tx.execute_batch(&format!("CREATE TABLE {} ({});", table, cols.join(", ")))?;
            info!("Created sheet {} with {} columns", self.sheet, schema.len());
        }

        {
            let cols: Vec<String> = schema.iter().map(|c| quote_ident(c)).collect();
            let slots: Vec<String> = (1..=schema.len()).map(|i| format!("?{}", i)).collect();
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                cols.join(", "),
                slots.join(", ")
            ))?;

            for record in records {
                let dropped: Vec<&str> = record.names().filter(|n| !schema.iter().any(|c| c == n)).collect();
                if !dropped.is_empty() {
                    debug!("Dropping fields outside the header: {:?}", dropped);
                }
                stmt.execute(rusqlite::params_from_iter(
                    schema.iter().map(|c| record.get(c).unwrap_or("")),
                ))?;
            }
        }

        tx.commit()?;
        Ok(records.len())
    }
}

/// Header for a new sheet. SQLite column names are case-insensitive, so of
/// names equal up to ASCII case only the first is kept.
fn header_for(record: &JobRecord) -> Vec<String> {
    let mut cols: Vec<String> = Vec::with_capacity(record.len());
    for name in record.names() {
        if cols.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            debug!("Field {:?} clashes with an earlier column, dropping it", name);
            continue;
        }
        cols.push(name.to_string());
    }
    cols
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Column names in declaration order. Empty when the table does not exist.
fn table_columns(conn: &Connection, name: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let cols = stmt
        .query_map([name], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(cols)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Key column cell: numbers as integer strings, text verbatim, nulls skipped.
fn key_cell(value: ValueRef<'_>) -> Option<String> {
    let key = match value {
        ValueRef::Null => return None,
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => (f as i64).to_string(),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
    };
    Some(key).filter(|k| !k.is_empty())
}

fn cell_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> JobRecord {
        pairs.iter().copied().collect()
    }

    fn temp_store() -> (tempfile::TempDir, SheetStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SheetStore::new(dir.path().join("data/jobs.sqlite"), "Details");
        (dir, store)
    }

    #[test]
    fn missing_store_is_empty() {
        let (_dir, store) = temp_store();
        assert!(store.existing_keys().unwrap().is_empty());
        assert!(store.records().unwrap().is_empty());
        assert!(store.info().unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn round_trip_into_empty_store() {
        let (_dir, store) = temp_store();
        let r = record(&[("Job Key No", "X1"), ("Title", "T")]);
        assert_eq!(store.append(&[r.clone()]).unwrap(), 1);

        let info = store.info().unwrap().unwrap();
        assert_eq!(info.columns, ["Job Key No", "Title"]);
        assert_eq!(info.rows, 1);
        assert_eq!(store.records().unwrap(), vec![r]);
        assert!(store.existing_keys().unwrap().contains(&JobKey::from("X1")));
    }

    #[test]
    fn later_appends_follow_existing_header() {
        let (_dir, store) = temp_store();
        store
            .append(&[record(&[("Job Key No", "1"), ("Title", "A"), ("Bid Ref", "1-2")])])
            .unwrap();
        store
            .append(&[record(&[("Title", "B"), ("Job Key No", "2"), ("Extra", "dropped")])])
            .unwrap();

        let rows = store.records().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1].iter().collect::<Vec<_>>(),
            [("Job Key No", "2"), ("Title", "B"), ("Bid Ref", "")]
        );
        assert_eq!(rows[1].get("Extra"), None);
    }

    #[test]
    fn numeric_key_cells_read_as_integers() {
        let (_dir, store) = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        let conn = Connection::open(store.path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE Details (\"Job Key No\", Title);
             INSERT INTO Details VALUES (42, 'a');
             INSERT INTO Details VALUES (7.0, 'b');
             INSERT INTO Details VALUES ('K-1', 'c');
             INSERT INTO Details VALUES (NULL, 'd');",
        )
        .unwrap();
        drop(conn);

        let keys = store.existing_keys().unwrap();
        let mut keys: Vec<&str> = keys.iter().map(JobKey::as_str).collect();
        keys.sort();
        assert_eq!(keys, ["42", "7", "K-1"]);
        assert_eq!(store.records().unwrap()[3].get("Job Key No"), Some(""));
    }

    #[test]
    fn file_without_sheet_is_empty() {
        let (_dir, store) = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        Connection::open(store.path())
            .unwrap()
            .execute_batch("CREATE TABLE Other (a TEXT);")
            .unwrap();
        assert!(store.existing_keys().unwrap().is_empty());
    }

    #[test]
    fn corrupt_store_is_an_error() {
        let (_dir, store) = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), vec![b'x'; 4096]).unwrap();

        assert!(matches!(store.existing_keys(), Err(StoreError::Corrupt { .. })));
        assert!(matches!(store.records(), Err(StoreError::Corrupt { .. })));
        assert!(matches!(
            store.append(&[record(&[("Job Key No", "1")])]),
            Err(StoreError::Corrupt { .. })
        ));
        assert_eq!(std::fs::read(store.path()).unwrap(), vec![b'x'; 4096]);
    }

    #[test]
    fn case_clashing_fields_share_one_column() {
        let (_dir, store) = temp_store();
        let r = record(&[("Job Key No", "1"), ("Location", "Central"), ("LOCATION", "Kowloon")]);
        assert_eq!(store.append(&[r]).unwrap(), 1);

        let info = store.info().unwrap().unwrap();
        assert_eq!(info.columns, ["Job Key No", "Location"]);
        assert_eq!(store.records().unwrap()[0].get("Location"), Some("Central"));
    }

    #[test]
    fn failed_append_writes_nothing() {
        let (_dir, store) = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        Connection::open(store.path())
            .unwrap()
            .execute_batch("CREATE TABLE Details (\"Job Key No\" TEXT, Title TEXT CHECK (Title <> 'bad'));")
            .unwrap();

        let good = record(&[("Job Key No", "1"), ("Title", "ok")]);
        let bad = record(&[("Job Key No", "2"), ("Title", "bad")]);
        assert!(store.append(&[good, bad]).is_err());
        assert!(store.existing_keys().unwrap().is_empty());
    }

    #[test]
    fn empty_batch_is_noop() {
        let (_dir, store) = temp_store();
        assert_eq!(store.append(&[]).unwrap(), 0);
        assert!(!store.path().exists());
    }
}
