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

//! Fixtures shared by the message mapper tests.

use std::collections::HashMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::prelude::*;

use super::MessageMapper;
use crate::blob::MemoryBlobStore;
use crate::mailbox::MailboxMapper;
use crate::model::*;
use crate::storage::codec::KeyComponent;
use crate::storage::{ColumnStore, MemoryStore, RowKey, RowStream, Table};
use crate::support::{
    error::Error, log_prefix::LogPrefix, system_config::MapperConfig,
};

/// A `ColumnStore` which simulates other writers winning compare-and-set
/// races on chosen message rows, and counts mutations per table.
///
/// It can also yield to the runtime before every compare-and-set, so that
/// writers joined on one task really interleave between their reads and
/// their writes.
#[derive(Clone, Default)]
pub struct InterferingStore {
    inner: MemoryStore,
    state: Arc<Mutex<InterferenceState>>,
}

#[derive(Default)]
struct InterferenceState {
    /// Remaining forced CAS losses by `MessageByUid` key.
    contended: HashMap<RowKey, u32>,
    /// Remaining failing deletes by table.
    failing_deletes: HashMap<Table, u32>,
    mutations: HashMap<Table, u32>,
    /// Compare-and-set requests which found the row changed, by table.
    cas_losses: HashMap<Table, u32>,
    yield_on_cas: bool,
}

impl InterferingStore {
    /// Make the next `rounds` flag-update CAS attempts on the given message
    /// fail as if another writer had changed it first.
    pub fn contend(&self, mailbox_id: MailboxId, uid: Uid, rounds: u32) {
        self.state.lock().unwrap().contended.insert(
            RowKey::new(mailbox_id.to_key(), uid.to_key()),
            rounds,
        );
    }

    /// Make the next `n` deletes from `table` fail with a transient error.
    pub fn fail_deletes(&self, table: Table, n: u32) {
        self.state.lock().unwrap().failing_deletes.insert(table, n);
    }

    /// Yield before every compare-and-set.
    pub fn interleave(&self) {
        self.state.lock().unwrap().yield_on_cas = true;
    }

    pub fn cas_losses(&self, table: Table) -> u32 {
        self.state
            .lock()
            .unwrap()
            .cas_losses
            .get(&table)
            .copied()
            .unwrap_or(0)
    }

    pub fn mutations(&self, table: Table) -> u32 {
        self.state
            .lock()
            .unwrap()
            .mutations
            .get(&table)
            .copied()
            .unwrap_or(0)
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    fn count(&self, table: Table) {
        *self
            .state
            .lock()
            .unwrap()
            .mutations
            .entry(table)
            .or_insert(0) += 1;
    }
}

#[async_trait]
impl ColumnStore for InterferingStore {
    async fn read(
        &self,
        table: Table,
        key: &RowKey,
    ) -> Result<Option<Vec<u8>>, Error> {
        self.inner.read(table, key).await
    }

    async fn write(
        &self,
        table: Table,
        key: &RowKey,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        self.count(table);
        self.inner.write(table, key, value).await
    }

    async fn delete(&self, table: Table, key: &RowKey) -> Result<(), Error> {
        self.count(table);
        {
            let mut state = self.state.lock().unwrap();
            if let Some(remaining) = state.failing_deletes.get_mut(&table) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Transient("injected".to_owned()));
                }
            }
        }

        self.inner.delete(table, key).await
    }

    async fn compare_and_set(
        &self,
        table: Table,
        key: &RowKey,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, Error> {
        self.count(table);
        let yield_on_cas = {
            let mut state = self.state.lock().unwrap();
            if Table::MessageByUid == table && expected.is_some() {
                if let Some(remaining) = state.contended.get_mut(key) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Ok(false);
                    }
                }
            }
            state.yield_on_cas
        };

        if yield_on_cas {
            tokio::task::yield_now().await;
        }

        let set = self.inner.compare_and_set(table, key, expected, new).await;
        if let Ok(false) = set {
            *self
                .state
                .lock()
                .unwrap()
                .cas_losses
                .entry(table)
                .or_insert(0) += 1;
        }
        set
    }

    async fn increment(
        &self,
        table: Table,
        key: &RowKey,
        delta: i64,
    ) -> Result<(), Error> {
        self.count(table);
        self.inner.increment(table, key, delta).await
    }

    async fn read_counter(
        &self,
        table: Table,
        key: &RowKey,
    ) -> Result<Option<i64>, Error> {
        self.inner.read_counter(table, key).await
    }

    fn read_range(
        &self,
        table: Table,
        partition: &[u8],
        from: Bound<&[u8]>,
        to: Bound<&[u8]>,
        limit: Option<usize>,
    ) -> RowStream {
        self.inner.read_range(table, partition, from, to, limit)
    }

    fn scan(&self, table: Table) -> RowStream {
        self.inner.scan(table)
    }
}

pub struct Fixture {
    pub store: InterferingStore,
    pub blobs: MemoryBlobStore,
    pub mailboxes: MailboxMapper,
    pub mapper: MessageMapper,
}

impl Fixture {
    pub fn new(config: MapperConfig) -> Self {
        crate::init_test_log();

        let store = InterferingStore::default();
        let shared: Arc<dyn ColumnStore> = Arc::new(store.clone());
        let blobs = MemoryBlobStore::new();
        let log_prefix = LogPrefix::new("test".to_owned());

        Self {
            mailboxes: MailboxMapper::new(
                log_prefix.clone(),
                Arc::clone(&shared),
                &config,
            ),
            mapper: MessageMapper::new(
                log_prefix,
                shared,
                Arc::new(blobs.clone()),
                config,
            ),
            store,
            blobs,
        }
    }

    pub async fn mailbox(&self, name: &str) -> MailboxId {
        self.mailboxes
            .create(MailboxPath::for_user("alice", name).unwrap())
            .await
            .unwrap()
            .id
    }

    pub async fn add(
        &self,
        mailbox_id: MailboxId,
        flags: &[Flag],
    ) -> MessageRecord {
        self.mapper
            .add(mailbox_id, new_message(flags))
            .await
            .unwrap()
    }
}

pub fn new_message(flags: &[Flag]) -> NewMessage {
    NewMessage {
        internal_date: FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 2, 3, 4, 5)
            .unwrap(),
        flags: flags.iter().cloned().collect(),
        body: format!("Subject: {flags:?}\r\n\r\nHello\r\n").into_bytes(),
    }
}
