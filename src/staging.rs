//! # Staging Store Module
//!
//! Cross-identification stages both catalogs in a relational store so that
//! records can be pulled by target trixel without holding either catalog in
//! memory.  This implementation uses SQLite; the `xmatch` engine only sees
//! the `CatalogSource` and `MatchSink` traits, so any keyed store with a
//! trixel index could stand in.
//!
//! Each staged catalog is one table with a `tgt_trixel` index.  Each match
//! run owns three append-only tables: the matches themselves, the rows left
//! unmatched inside the search radius, and the proper-motion duplicates
//! recognized along the way.  A `metadata` table maps table names to a JSON
//! blob recording how the table was produced.

use std::path::Path;
use log::info;
use regex::Regex;
use rusqlite::{params,params_from_iter,Connection};
use serde::Serialize;

use crate::xmatch::{CatalogSource,MatchRow,MatchSink,SourceRow};
use crate::{DYNERR,STDRESULT};

/// Enumerates staging errors.  The `Display` trait will print equivalent long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("`{0}` is not usable as a table name")]
    BadTableName(String),
    #[error("no staged catalog named `{0}`")]
    UnknownCatalog(String)
}

fn check_ident(name: &str) -> Result<(),Error> {
    let patt = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("regex parsing error");
    match patt.is_match(name) {
        true => Ok(()),
        false => Err(Error::BadTableName(name.to_string()))
    }
}

/// SQLite-backed staging store.
pub struct StagingStore {
    conn: Connection
}

impl StagingStore {
    pub fn open(path: &Path) -> Result<Self,DYNERR> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }
    /// Purely in-memory store, handy for tests and one-shot runs.
    pub fn open_in_memory() -> Result<Self,DYNERR> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }
    fn init(conn: Connection) -> Result<Self,DYNERR> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata (
                table_name TEXT PRIMARY KEY,
                info TEXT NOT NULL)",
            params![])?;
        Ok(Self { conn })
    }
    /// Create (or keep) a staged-catalog table with its trixel indices.
    pub fn create_catalog(&self,name: &str) -> STDRESULT {
        check_ident(name)?;
        self.conn.execute(&format!(
            "CREATE TABLE IF NOT EXISTS `{}` (
                id INTEGER PRIMARY KEY,
                ra REAL NOT NULL,
                dec REAL NOT NULL,
                mag REAL,
                ep_ra REAL,
                ep_dec REAL,
                src_trixel INTEGER,
                tgt_trixel INTEGER NOT NULL)",name),
            params![])?;
        self.conn.execute(&format!(
            "CREATE INDEX IF NOT EXISTS `idx__{0}__tgt_trixel` ON `{0}` (tgt_trixel)",name),
            params![])?;
        self.conn.execute(&format!(
            "CREATE INDEX IF NOT EXISTS `idx__{0}__src_trixel` ON `{0}` (src_trixel)",name),
            params![])?;
        Ok(())
    }
    /// Empty a staged catalog for a fresh ingest.
    pub fn clear_catalog(&self,name: &str) -> STDRESULT {
        check_ident(name)?;
        self.conn.execute(&format!("DELETE FROM `{}`",name),params![])?;
        Ok(())
    }
    /// Insert one staged row.  A negative id requests auto-assignment; the
    /// row's id in the store is returned either way.
    pub fn insert_source(&self,catalog: &str,row: &SourceRow) -> Result<i64,DYNERR> {
        check_ident(catalog)?;
        match row.id >= 0 {
            true => {
                self.conn.execute(&format!(
                    "INSERT INTO `{}` (id, ra, dec, mag, ep_ra, ep_dec, src_trixel, tgt_trixel)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",catalog),
                    params![row.id,row.ra,row.dec,row.mag,row.ep_ra,row.ep_dec,row.source_trixel,row.target_trixel])?;
                Ok(row.id)
            },
            false => {
                self.conn.execute(&format!(
                    "INSERT INTO `{}` (ra, dec, mag, ep_ra, ep_dec, src_trixel, tgt_trixel)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",catalog),
                    params![row.ra,row.dec,row.mag,row.ep_ra,row.ep_dec,row.source_trixel,row.target_trixel])?;
                Ok(self.conn.last_insert_rowid())
            }
        }
    }
    /// Staged row count of a catalog.
    pub fn catalog_len(&self,name: &str) -> Result<u64,DYNERR> {
        check_ident(name)?;
        let count: i64 = self.conn.query_row(&format!("SELECT COUNT() FROM `{}`",name),params![],|r| r.get(0))?;
        Ok(count as u64)
    }
    /// View of a staged catalog implementing `CatalogSource`.
    pub fn catalog(&self,name: &str) -> Result<CatalogTable<'_>,DYNERR> {
        check_ident(name)?;
        let exists: i64 = self.conn.query_row(
            "SELECT COUNT() FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],|r| r.get(0))?;
        if exists==0 {
            return Err(Box::new(Error::UnknownCatalog(name.to_string())));
        }
        Ok(CatalogTable {
            conn: &self.conn,
            table: name.to_string()
        })
    }
    /// Create (or keep) the three append-only tables of a match run.
    pub fn create_match_tables(&self,name: &str) -> STDRESULT {
        check_ident(name)?;
        self.conn.execute(&format!(
            "CREATE TABLE IF NOT EXISTS `{}` (
                id INTEGER PRIMARY KEY,
                a_id INTEGER NOT NULL,
                b_id INTEGER NOT NULL,
                distance REAL NOT NULL)",name),
            params![])?;
        self.conn.execute(&format!(
            "CREATE INDEX IF NOT EXISTS `idx__{0}__b` ON `{0}` (b_id)",name),
            params![])?;
        self.conn.execute(&format!(
            "CREATE TABLE IF NOT EXISTS `{}_unmatched` (
                a_id INTEGER PRIMARY KEY,
                closest_b_id INTEGER,
                distance_arcsec REAL)",name),
            params![])?;
        self.conn.execute(&format!(
            "CREATE TABLE IF NOT EXISTS `{}_pm_duplicates` (
                dup_id INTEGER PRIMARY KEY,
                orig_id INTEGER NOT NULL)",name),
            params![])?;
        Ok(())
    }
    /// Sink appending into a match run's tables.
    pub fn match_sink(&self,name: &str) -> Result<SqliteMatchSink<'_>,DYNERR> {
        check_ident(name)?;
        self.create_match_tables(name)?;
        Ok(SqliteMatchSink {
            conn: &self.conn,
            table: name.to_string()
        })
    }
    /// All matches of a run, in insertion order.
    pub fn matches(&self,name: &str) -> Result<Vec<MatchRow>,DYNERR> {
        check_ident(name)?;
        let mut stmt = self.conn.prepare(&format!("SELECT a_id, b_id, distance FROM `{}` ORDER BY id",name))?;
        let rows = stmt.query_map(params![],|r| Ok(MatchRow {
            a_id: r.get(0)?,
            b_id: r.get(1)?,
            distance: r.get(2)?
        }))?;
        let mut ans = Vec::new();
        for row in rows {
            ans.push(row?);
        }
        Ok(ans)
    }
    /// Record how a table was produced, timestamped, as a JSON blob.
    pub fn set_metadata<T: Serialize>(&self,table: &str,info: &T) -> STDRESULT {
        let blob = serde_json::json!({
            "created": chrono::Utc::now().to_rfc3339(),
            "info": info
        });
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (table_name, info) VALUES (?1, ?2)",
            params![table,blob.to_string()])?;
        Ok(())
    }
    pub fn metadata(&self,table: &str) -> Result<Option<serde_json::Value>,DYNERR> {
        let mut stmt = self.conn.prepare("SELECT info FROM metadata WHERE table_name = ?1")?;
        let mut rows = stmt.query(params![table])?;
        match rows.next()? {
            Some(row) => {
                let blob: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&blob)?))
            },
            None => Ok(None)
        }
    }
}

/// One staged catalog table, read-only.
pub struct CatalogTable<'a> {
    conn: &'a Connection,
    table: String
}

impl CatalogTable<'_> {
    fn collect(&self,sql: &str,bind: &[u32]) -> Result<Vec<SourceRow>,DYNERR> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(bind.iter()),|r| Ok(SourceRow {
            id: r.get(0)?,
            ra: r.get(1)?,
            dec: r.get(2)?,
            mag: r.get(3)?,
            ep_ra: r.get(4)?,
            ep_dec: r.get(5)?,
            source_trixel: r.get(6)?,
            target_trixel: r.get(7)?
        }))?;
        let mut ans = Vec::new();
        for row in rows {
            ans.push(row?);
        }
        Ok(ans)
    }
}

impl CatalogSource for CatalogTable<'_> {
    fn sources_in_trixel(&self,trixel: u32) -> Result<Vec<SourceRow>,DYNERR> {
        self.collect(&format!(
            "SELECT id, ra, dec, mag, ep_ra, ep_dec, src_trixel, tgt_trixel FROM `{}` WHERE tgt_trixel = ?1 ORDER BY id",
            self.table),&[trixel])
    }
    fn sources_in_trixels(&self,trixels: &[u32]) -> Result<Vec<SourceRow>,DYNERR> {
        if trixels.is_empty() {
            return Ok(Vec::new());
        }
        let marks = vec!["?";trixels.len()].join(", ");
        self.collect(&format!(
            "SELECT id, ra, dec, mag, ep_ra, ep_dec, src_trixel, tgt_trixel FROM `{}` WHERE tgt_trixel IN ({}) ORDER BY id",
            self.table,marks),trixels)
    }
    fn sources_with_source_trixel(&self,trixel: u32) -> Result<Vec<SourceRow>,DYNERR> {
        self.collect(&format!(
            "SELECT id, ra, dec, mag, ep_ra, ep_dec, src_trixel, tgt_trixel FROM `{}` WHERE src_trixel = ?1 ORDER BY id",
            self.table),&[trixel])
    }
}

/// Sink appending a match run into the staging store.
pub struct SqliteMatchSink<'a> {
    conn: &'a Connection,
    table: String
}

impl MatchSink for SqliteMatchSink<'_> {
    fn push_match(&mut self,row: &MatchRow) -> STDRESULT {
        self.conn.execute(&format!(
            "INSERT INTO `{}` (a_id, b_id, distance) VALUES (?1, ?2, ?3)",self.table),
            params![row.a_id,row.b_id,row.distance])?;
        Ok(())
    }
    fn push_unmatched(&mut self,a_id: i64,closest_b: i64,distance_arcsec: f64) -> STDRESULT {
        self.conn.execute(&format!(
            "INSERT OR REPLACE INTO `{}_unmatched` (a_id, closest_b_id, distance_arcsec) VALUES (?1, ?2, ?3)",self.table),
            params![a_id,closest_b,distance_arcsec])?;
        Ok(())
    }
    fn push_pm_duplicate(&mut self,dup_id: i64,orig_id: i64) -> STDRESULT {
        self.conn.execute(&format!(
            "INSERT OR REPLACE INTO `{}_pm_duplicates` (dup_id, orig_id) VALUES (?1, ?2)",self.table),
            params![dup_id,orig_id])?;
        Ok(())
    }
}

/// Convenience for a whole staged run: create the match tables, run the
/// matcher, and record the run in the metadata table.
pub fn run_match(store: &StagingStore,matcher: &crate::xmatch::CrossMatcher,
    a_name: &str,b_name: &str,match_table: &str) -> Result<crate::xmatch::MatchStats,DYNERR> {
    let a = store.catalog(a_name)?;
    let b = store.catalog(b_name)?;
    let mut sink = store.match_sink(match_table)?;
    let stats = matcher.run(&a,&b,&mut sink)?;
    store.set_metadata(match_table,&serde_json::json!({
        "a": a_name,
        "b": b_name,
        "matched": stats.matched,
        "unmatched": stats.unmatched,
        "pm_duplicates": stats.pm_duplicates
    }))?;
    info!("match run {} -> {} recorded into {}",a_name,b_name,match_table);
    Ok(stats)
}
