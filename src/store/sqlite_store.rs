//! Embedded SQLite store implementation for filter data.
use std::{path::PathBuf, str::FromStr};

use anyhow::Context;
use async_trait::async_trait;
use bitcoin::{BlockHash, FilterHeader};
use rusqlite::{params, Connection};
use tokio::task;

use crate::chain::{BlockPosition, FilterType};
use crate::store::FilterDatabase;

/// SQLite-backed [`FilterDatabase`].
///
/// Schema:
///   state(key TEXT PRIMARY KEY, value TEXT NOT NULL)          -- tips
///   headers(ftype INTEGER, block TEXT, header TEXT, ...)      -- chained headers
///   filters(ftype INTEGER, block TEXT, n INTEGER, content BLOB, ...)
///
/// Tip keys in `state`:
///  - header_tip_height:<ftype> / header_tip_hash:<ftype>
///  - filter_tip_height:<ftype> / filter_tip_hash:<ftype>
pub struct SqliteFilterStore {
    path: PathBuf,
}

impl SqliteFilterStore {
    /// Creates/initializes the SQLite file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS headers (
                ftype  INTEGER NOT NULL,
                block  TEXT NOT NULL,
                header TEXT NOT NULL,
                PRIMARY KEY (ftype, block)
            );
            CREATE TABLE IF NOT EXISTS filters (
                ftype   INTEGER NOT NULL,
                block   TEXT NOT NULL,
                n       INTEGER NOT NULL,
                content BLOB NOT NULL,
                PRIMARY KEY (ftype, block)
            );
            "#,
        )?;
        Ok(Self { path })
    }

    fn kv_get(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
        let mut stmt = conn.prepare("SELECT value FROM state WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            let v: String = row.get(0)?;
            Ok(Some(v))
        } else {
            Ok(None)
        }
    }

    fn kv_set(conn: &Connection, key: &str, val: &str) -> anyhow::Result<()> {
        conn.execute(
            "INSERT INTO state(key,value) VALUES(?1,?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, val],
        )?;
        Ok(())
    }

    fn tip_get(
        conn: &Connection,
        prefix: &str,
        ftype: FilterType,
    ) -> anyhow::Result<Option<BlockPosition>> {
        let t = ftype.to_u8();
        let h = Self::kv_get(conn, &format!("{prefix}_height:{t}"))?;
        let hh = Self::kv_get(conn, &format!("{prefix}_hash:{t}"))?;
        match (h, hh) {
            (Some(hs), Some(hh)) => {
                let height: u32 = hs
                    .parse()
                    .with_context(|| format!("parse {prefix}_height"))?;
                let hash =
                    BlockHash::from_str(&hh).with_context(|| format!("parse {prefix}_hash"))?;
                Ok(Some(BlockPosition::new(height, hash)))
            }
            _ => Ok(None),
        }
    }

    fn tip_set(
        conn: &Connection,
        prefix: &str,
        ftype: FilterType,
        tip: &BlockPosition,
    ) -> anyhow::Result<()> {
        let t = ftype.to_u8();
        Self::kv_set(conn, &format!("{prefix}_height:{t}"), &tip.height.to_string())?;
        Self::kv_set(conn, &format!("{prefix}_hash:{t}"), &tip.hash.to_string())?;
        Ok(())
    }
}

#[async_trait]
impl FilterDatabase for SqliteFilterStore {
    async fn header_tip(&self, filter_type: FilterType) -> anyhow::Result<Option<BlockPosition>> {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            Self::tip_get(&conn, "header_tip", filter_type)
        })
        .await?
    }

    async fn filter_tip(&self, filter_type: FilterType) -> anyhow::Result<Option<BlockPosition>> {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            Self::tip_get(&conn, "filter_tip", filter_type)
        })
        .await?
    }

    async fn load_filter_header(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<FilterHeader>> {
        let path = self.path.clone();
        let block = block.to_string();
        task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            let mut stmt =
                conn.prepare("SELECT header FROM headers WHERE ftype = ?1 AND block = ?2")?;
            let mut rows = stmt.query(params![filter_type.to_u8(), block])?;
            if let Some(row) = rows.next()? {
                let raw: String = row.get(0)?;
                Ok(Some(FilterHeader::from_str(&raw).context("parse header")?))
            } else {
                Ok(None)
            }
        })
        .await?
    }

    async fn load_filter(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<(u64, Vec<u8>)>> {
        let path = self.path.clone();
        let block = block.to_string();
        task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            let mut stmt =
                conn.prepare("SELECT n, content FROM filters WHERE ftype = ?1 AND block = ?2")?;
            let mut rows = stmt.query(params![filter_type.to_u8(), block])?;
            if let Some(row) = rows.next()? {
                let n: i64 = row.get(0)?;
                let content: Vec<u8> = row.get(1)?;
                Ok(Some((n as u64, content)))
            } else {
                Ok(None)
            }
        })
        .await?
    }

    async fn store_filter_headers(
        &self,
        filter_type: FilterType,
        headers: &[(BlockHash, FilterHeader)],
        new_tip: BlockPosition,
    ) -> anyhow::Result<()> {
        let path = self.path.clone();
        let rows: Vec<(String, String)> = headers
            .iter()
            .map(|(block, header)| (block.to_string(), header.to_string()))
            .collect();
        task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            let tx = conn.unchecked_transaction()?;
            for (block, header) in &rows {
                conn.execute(
                    "INSERT INTO headers(ftype,block,header) VALUES(?1,?2,?3)
                     ON CONFLICT(ftype,block) DO UPDATE SET header=excluded.header",
                    params![filter_type.to_u8(), block, header],
                )?;
            }
            Self::tip_set(&conn, "header_tip", filter_type, &new_tip)?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn store_filters(
        &self,
        filter_type: FilterType,
        filters: &[(BlockHash, u64, Vec<u8>)],
        new_tip: BlockPosition,
    ) -> anyhow::Result<()> {
        let path = self.path.clone();
        let rows: Vec<(String, i64, Vec<u8>)> = filters
            .iter()
            .map(|(block, n, content)| (block.to_string(), *n as i64, content.clone()))
            .collect();
        task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            let tx = conn.unchecked_transaction()?;
            for (block, n, content) in &rows {
                conn.execute(
                    "INSERT INTO filters(ftype,block,n,content) VALUES(?1,?2,?3,?4)
                     ON CONFLICT(ftype,block) DO UPDATE SET n=excluded.n, content=excluded.content",
                    params![filter_type.to_u8(), block, n, content],
                )?;
            }
            Self::tip_set(&conn, "filter_tip", filter_type, &new_tip)?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn rollback(
        &self,
        filter_type: FilterType,
        position: &BlockPosition,
    ) -> anyhow::Result<()> {
        let path = self.path.clone();
        let position = *position;
        task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            let tx = conn.unchecked_transaction()?;
            for prefix in ["header_tip", "filter_tip"] {
                if let Some(tip) = Self::tip_get(&conn, prefix, filter_type)? {
                    if tip.height > position.height {
                        Self::tip_set(&conn, prefix, filter_type, &position)?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }
}
