//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Crymap.
//
// Crymap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Crymap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Crymap. If not, see <http://www.gnu.org/licenses/>.

//! A column store backed by a single SQLite database.
//!
//! This is what the command-line tools run against. The SQLite database is
//! used strictly as a column store: every operation is a single statement
//! against a single row, so nothing here relies on SQLite transactions for
//! correctness beyond what a real wide-column store would provide.

use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, StreamExt};
use log::info;
use rusqlite::types::Value;
use rusqlite::OptionalExtension as _;

use super::column::*;
use crate::support::{error::Error, log_prefix::LogPrefix};

static MIGRATION_V1: &str = "\
CREATE TABLE `row` (
  `tbl` TEXT NOT NULL,
  `partition` BLOB NOT NULL,
  `clustering` BLOB NOT NULL,
  `value` BLOB NOT NULL,
  PRIMARY KEY (`tbl`, `partition`, `clustering`)
) STRICT, WITHOUT ROWID;

CREATE TABLE `counter` (
  `tbl` TEXT NOT NULL,
  `partition` BLOB NOT NULL,
  `clustering` BLOB NOT NULL,
  `value` INTEGER NOT NULL,
  PRIMARY KEY (`tbl`, `partition`, `clustering`)
) STRICT, WITHOUT ROWID;
";

static MIGRATIONS: &[&str] = &[MIGRATION_V1];

/// A connection to a SQLite-backed column store.
///
/// Clones share the connection. All database work is done on the blocking
/// thread pool.
#[derive(Clone)]
pub struct SqliteStore {
    cxn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteStore {
    pub fn open(log_prefix: &LogPrefix, path: &Path) -> Result<Self, Error> {
        let mut cxn = rusqlite::Connection::open(path)?;
        cxn.busy_timeout(Duration::from_secs(10))?;
        cxn.pragma_update(None, "journal_mode", "WAL")?;
        apply_migrations(log_prefix, &mut cxn)?;

        Ok(Self {
            cxn: Arc::new(Mutex::new(cxn)),
        })
    }

    /// Open a store that lives only as long as this value.
    pub fn open_in_memory(log_prefix: &LogPrefix) -> Result<Self, Error> {
        let mut cxn = rusqlite::Connection::open_in_memory()?;
        apply_migrations(log_prefix, &mut cxn)?;

        Ok(Self {
            cxn: Arc::new(Mutex::new(cxn)),
        })
    }

    async fn with_cxn<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut rusqlite::Connection) -> Result<R, Error>
            + Send
            + 'static,
    ) -> Result<R, Error> {
        let cxn = Arc::clone(&self.cxn);
        tokio::task::spawn_blocking(move || {
            let mut cxn = cxn.lock().unwrap();
            f(&mut cxn)
        })
        .await?
    }

    fn query_rows(&self, sql: String, params: Vec<Value>) -> RowStream {
        let cxn = Arc::clone(&self.cxn);
        let fetch = async move {
            let result = tokio::task::spawn_blocking(
                move || -> Result<Vec<Row>, Error> {
                    let cxn = cxn.lock().unwrap();
                    let mut stmt = cxn.prepare(&sql)?;
                    let rows = stmt
                        .query_map(rusqlite::params_from_iter(params), |row| {
                            Ok(Row {
                                key: RowKey::new(row.get(0)?, row.get(1)?),
                                value: row.get(2)?,
                            })
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(rows)
                },
            )
            .await;

            match result {
                Ok(rows) => rows,
                Err(e) => Err(Error::from(e)),
            }
        };

        stream::once(fetch)
            .map(|result| match result {
                Ok(rows) => {
                    stream::iter(rows.into_iter().map(Ok)).left_stream()
                },
                Err(e) => stream::once(future::ready(Err(e))).right_stream(),
            })
            .flatten()
            .boxed()
    }
}

fn apply_migrations(
    log_prefix: &LogPrefix,
    cxn: &mut rusqlite::Connection,
) -> Result<(), Error> {
    let txn = cxn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Exclusive)?;
    txn.execute(
        "CREATE TABLE IF NOT EXISTS `migration` (\
         `version` INTEGER NOT NULL PRIMARY KEY, \
         `applied_at` INTEGER NOT NULL\
         ) STRICT",
        (),
    )?;

    let current_version = txn
        .query_row("SELECT MAX(`version`) FROM `migration`", (), |row| {
            row.get::<_, Option<usize>>(0)
        })?
        .unwrap_or(0);

    for (version, migration) in MIGRATIONS
        .iter()
        .copied()
        .enumerate()
        .map(|(ix, migration)| (ix + 1, migration))
        .skip(current_version)
    {
        info!("{log_prefix} Applying #{version} migration to SQLite store");
        txn.execute_batch(migration)?;
        txn.execute(
            "INSERT INTO `migration` (`version`, `applied_at`) \
             VALUES (?, ?)",
            (version, chrono::Utc::now().timestamp()),
        )?;
    }

    txn.commit()?;
    Ok(())
}

fn key_params(table: Table, key: &RowKey) -> (&'static str, Vec<u8>, Vec<u8>) {
    (table.name(), key.partition.clone(), key.clustering.clone())
}

#[async_trait]
impl ColumnStore for SqliteStore {
    async fn read(
        &self,
        table: Table,
        key: &RowKey,
    ) -> Result<Option<Vec<u8>>, Error> {
        let (tbl, partition, clustering) = key_params(table, key);
        self.with_cxn(move |cxn| {
            Ok(cxn
                .query_row(
                    "SELECT `value` FROM `row` \
                     WHERE `tbl` = ? AND `partition` = ? AND `clustering` = ?",
                    (tbl, partition, clustering),
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?)
        })
        .await
    }

    async fn write(
        &self,
        table: Table,
        key: &RowKey,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        let (tbl, partition, clustering) = key_params(table, key);
        self.with_cxn(move |cxn| {
            cxn.execute(
                "INSERT OR REPLACE INTO `row` \
                 (`tbl`, `partition`, `clustering`, `value`) \
                 VALUES (?, ?, ?, ?)",
                (tbl, partition, clustering, value),
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, table: Table, key: &RowKey) -> Result<(), Error> {
        let (tbl, partition, clustering) = key_params(table, key);
        self.with_cxn(move |cxn| {
            cxn.execute(
                "DELETE FROM `row` \
                 WHERE `tbl` = ? AND `partition` = ? AND `clustering` = ?",
                (tbl, partition, clustering),
            )?;
            Ok(())
        })
        .await
    }

    async fn compare_and_set(
        &self,
        table: Table,
        key: &RowKey,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, Error> {
        let (tbl, partition, clustering) = key_params(table, key);
        let expected = expected.map(<[u8]>::to_vec);
        self.with_cxn(move |cxn| {
            let changed = match (expected, new) {
                (Some(expected), Some(new)) => cxn.execute(
                    "UPDATE `row` SET `value` = ? \
                     WHERE `tbl` = ? AND `partition` = ? AND `clustering` = ? \
                     AND `value` = ?",
                    (new, tbl, partition, clustering, expected),
                )?,
                (None, Some(new)) => cxn.execute(
                    "INSERT OR IGNORE INTO `row` \
                     (`tbl`, `partition`, `clustering`, `value`) \
                     VALUES (?, ?, ?, ?)",
                    (tbl, partition, clustering, new),
                )?,
                (Some(expected), None) => cxn.execute(
                    "DELETE FROM `row` \
                     WHERE `tbl` = ? AND `partition` = ? AND `clustering` = ? \
                     AND `value` = ?",
                    (tbl, partition, clustering, expected),
                )?,
                (None, None) => {
                    let existing = cxn.query_row(
                        "SELECT COUNT(*) FROM `row` \
                         WHERE `tbl` = ? AND `partition` = ? \
                         AND `clustering` = ?",
                        (tbl, partition, clustering),
                        |row| row.get::<_, i64>(0),
                    )?;
                    usize::from(0 == existing)
                },
            };

            Ok(1 == changed)
        })
        .await
    }

    async fn increment(
        &self,
        table: Table,
        key: &RowKey,
        delta: i64,
    ) -> Result<(), Error> {
        let (tbl, partition, clustering) = key_params(table, key);
        self.with_cxn(move |cxn| {
            cxn.execute(
                "INSERT INTO `counter` \
                 (`tbl`, `partition`, `clustering`, `value`) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT DO UPDATE SET `value` = `value` + excluded.`value`",
                (tbl, partition, clustering, delta),
            )?;
            Ok(())
        })
        .await
    }

    async fn read_counter(
        &self,
        table: Table,
        key: &RowKey,
    ) -> Result<Option<i64>, Error> {
        let (tbl, partition, clustering) = key_params(table, key);
        self.with_cxn(move |cxn| {
            Ok(cxn
                .query_row(
                    "SELECT `value` FROM `counter` \
                     WHERE `tbl` = ? AND `partition` = ? AND `clustering` = ?",
                    (tbl, partition, clustering),
                    |row| row.get::<_, i64>(0),
                )
                .optional()?)
        })
        .await
    }

    fn read_range(
        &self,
        table: Table,
        partition: &[u8],
        from: Bound<&[u8]>,
        to: Bound<&[u8]>,
        limit: Option<usize>,
    ) -> RowStream {
        let mut sql = "SELECT `partition`, `clustering`, `value` FROM `row` \
                       WHERE `tbl` = ? AND `partition` = ?"
            .to_owned();
        let mut params = vec![
            Value::Text(table.name().to_owned()),
            Value::Blob(partition.to_vec()),
        ];

        match from {
            Bound::Included(from) => {
                sql.push_str(" AND `clustering` >= ?");
                params.push(Value::Blob(from.to_vec()));
            },
            Bound::Excluded(from) => {
                sql.push_str(" AND `clustering` > ?");
                params.push(Value::Blob(from.to_vec()));
            },
            Bound::Unbounded => {},
        }

        match to {
            Bound::Included(to) => {
                sql.push_str(" AND `clustering` <= ?");
                params.push(Value::Blob(to.to_vec()));
            },
            Bound::Excluded(to) => {
                sql.push_str(" AND `clustering` < ?");
                params.push(Value::Blob(to.to_vec()));
            },
            Bound::Unbounded => {},
        }

        sql.push_str(" ORDER BY `clustering`");
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            params.push(Value::Integer(
                i64::try_from(limit).unwrap_or(i64::MAX),
            ));
        }

        self.query_rows(sql, params)
    }

    fn scan(&self, table: Table) -> RowStream {
        self.query_rows(
            "SELECT `partition`, `clustering`, `value` FROM `row` \
             WHERE `tbl` = ?"
                .to_owned(),
            vec![Value::Text(table.name().to_owned())],
        )
    }
}
