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

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use super::column::*;
use crate::support::error::Error;

/// A column store held entirely in memory.
///
/// Every call takes the lock once, so each call is atomic with respect to the
/// others, exactly like a single-row operation on a real store. Streams are
/// materialised when created.
///
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<Table, BTreeMap<RowKey, Vec<u8>>>,
    counters: HashMap<Table, BTreeMap<RowKey, i64>>,
    /// Number of upcoming mutations of each table that will fail with a
    /// transient error.
    write_faults: HashMap<Table, u32>,
}

impl Inner {
    fn check_write_fault(&mut self, table: Table) -> Result<(), Error> {
        match self.write_faults.get_mut(&table) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::Transient(format!(
                    "injected write failure on {}",
                    table.name()
                )))
            },
            _ => Ok(()),
        }
    }

    fn table(&mut self, table: Table) -> &mut BTreeMap<RowKey, Vec<u8>> {
        self.rows.entry(table).or_default()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cause the next `n` mutations (write, delete, compare-and-set,
    /// increment) of `table` to fail with a transient error.
    pub fn fail_next_writes(&self, table: Table, n: u32) {
        self.inner.lock().unwrap().write_faults.insert(table, n);
    }

    /// The number of ordinary rows currently in `table`.
    pub fn row_count(&self, table: Table) -> usize {
        self.inner
            .lock()
            .unwrap()
            .rows
            .get(&table)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl ColumnStore for MemoryStore {
    async fn read(
        &self,
        table: Table,
        key: &RowKey,
    ) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .rows
            .get(&table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn write(
        &self,
        table: Table,
        key: &RowKey,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_write_fault(table)?;
        inner.table(table).insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&self, table: Table, key: &RowKey) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_write_fault(table)?;
        inner.table(table).remove(key);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        table: Table,
        key: &RowKey,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_write_fault(table)?;
        let rows = inner.table(table);
        if rows.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }

        match new {
            Some(new) => {
                rows.insert(key.clone(), new);
            },
            None => {
                rows.remove(key);
            },
        }

        Ok(true)
    }

    async fn increment(
        &self,
        table: Table,
        key: &RowKey,
        delta: i64,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_write_fault(table)?;
        *inner
            .counters
            .entry(table)
            .or_default()
            .entry(key.clone())
            .or_insert(0) += delta;
        Ok(())
    }

    async fn read_counter(
        &self,
        table: Table,
        key: &RowKey,
    ) -> Result<Option<i64>, Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .counters
            .get(&table)
            .and_then(|counters| counters.get(key))
            .copied())
    }

    fn read_range(
        &self,
        table: Table,
        partition: &[u8],
        from: Bound<&[u8]>,
        to: Bound<&[u8]>,
        limit: Option<usize>,
    ) -> RowStream {
        let inner = self.inner.lock().unwrap();
        let start = RowKey::new(partition.to_vec(), Vec::new());
        let rows = inner
            .rows
            .get(&table)
            .map(|rows| {
                rows.range(start..)
                    .take_while(|&(k, _)| k.partition == partition)
                    .filter(|&(k, _)| in_bounds(&k.clustering, from, to))
                    .take(limit.unwrap_or(usize::MAX))
                    .map(|(k, v)| {
                        Ok(Row {
                            key: k.clone(),
                            value: v.clone(),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        stream::iter(rows).boxed()
    }

    fn scan(&self, table: Table) -> RowStream {
        let inner = self.inner.lock().unwrap();
        let rows = inner
            .rows
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .map(|(k, v)| {
                        Ok(Row {
                            key: k.clone(),
                            value: v.clone(),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        stream::iter(rows).boxed()
    }
}
