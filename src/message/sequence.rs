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

//! UID and modseq allocation.
//!
//! Each mailbox has one counter row per sequence holding the last value
//! handed out. Allocation is a read followed by a compare-and-set of the
//! incremented value, retried against the freshly observed value whenever
//! another allocator got there first.
//!
//! Every allocation first checks that the mailbox is still in the directory,
//! since the counter row of a deleted mailbox can outlive it.

use std::sync::Arc;

use log::{debug, error};

use crate::mailbox::MailboxDirectory;
use crate::model::*;
use crate::storage::codec::{decode_sequence, encode_sequence, KeyComponent};
use crate::storage::{ColumnStore, RowKey, Table};
use crate::support::{error::Error, system_config::MapperConfig};

#[derive(Clone)]
struct SequenceCounter {
    store: Arc<dyn ColumnStore>,
    directory: MailboxDirectory,
    table: Table,
    max_attempts: u32,
    /// The largest value the sequence may take.
    limit: u64,
    exhausted: fn() -> Error,
    what: &'static str,
}

impl SequenceCounter {
    fn key(mailbox: MailboxId) -> RowKey {
        RowKey::single(mailbox.to_key())
    }

    async fn current(&self, mailbox: MailboxId) -> Result<Option<u64>, Error> {
        match self.store.read(self.table, &Self::key(mailbox)).await? {
            None => Ok(None),
            Some(raw) => decode_sequence(self.table, &raw).map(Some),
        }
    }

    async fn next(&self, mailbox: MailboxId) -> Result<u64, Error> {
        if self.directory.retrieve(mailbox).await?.is_none() {
            return Err(Error::NxMailbox);
        }

        let key = Self::key(mailbox);

        for attempt in 1..=self.max_attempts {
            let raw = match self.store.read(self.table, &key).await {
                Ok(raw) => raw,
                Err(e) if e.is_transient() => {
                    debug!("{} read for {mailbox} failed: {e}", self.what);
                    continue;
                },
                Err(e) => return Err(e),
            };

            let current = match raw {
                Some(ref raw) => decode_sequence(self.table, raw)?,
                None => 0,
            };

            if current >= self.limit {
                return Err((self.exhausted)());
            }

            let next = current + 1;
            match self
                .store
                .compare_and_set(
                    self.table,
                    &key,
                    raw.as_deref(),
                    Some(encode_sequence(next)),
                )
                .await
            {
                Ok(true) => return Ok(next),
                Ok(false) => {
                    debug!(
                        "{} for {mailbox} contended on attempt {attempt}",
                        self.what
                    );
                },
                Err(e) if e.is_transient() => {
                    debug!("{} write for {mailbox} failed: {e}", self.what);
                },
                Err(e) => return Err(e),
            }
        }

        error!(
            "{} for {mailbox} still contended after {} attempts",
            self.what, self.max_attempts
        );
        Err(Error::Contended {
            what: self.what,
            attempts: self.max_attempts,
        })
    }

    async fn forget(&self, mailbox: MailboxId) -> Result<(), Error> {
        self.store.delete(self.table, &Self::key(mailbox)).await
    }
}

/// Allocates UIDs.
#[derive(Clone)]
pub struct UidProvider {
    counter: SequenceCounter,
}

impl UidProvider {
    pub fn new(store: Arc<dyn ColumnStore>, config: &MapperConfig) -> Self {
        Self {
            counter: SequenceCounter {
                directory: MailboxDirectory::new(Arc::clone(&store)),
                store,
                table: Table::UidCounter,
                max_attempts: config.max_sequence_retries.max(1),
                limit: u64::from(u32::MAX),
                exhausted: || Error::UidExhausted,
                what: "UID allocation",
            },
        }
    }

    /// Allocate the next UID of `mailbox`.
    ///
    /// The first UID of a mailbox is 1. No value is ever returned twice for
    /// the same mailbox, but values can be skipped if the caller does not end
    /// up using them.
    pub async fn next_uid(&self, mailbox: MailboxId) -> Result<Uid, Error> {
        let next = self.counter.next(mailbox).await?;
        u32::try_from(next)
            .ok()
            .and_then(Uid::of)
            .ok_or(Error::UidExhausted)
    }

    /// The last UID allocated in `mailbox`, if any.
    pub async fn last_uid(
        &self,
        mailbox: MailboxId,
    ) -> Result<Option<Uid>, Error> {
        Ok(self
            .counter
            .current(mailbox)
            .await?
            .and_then(|v| u32::try_from(v).ok())
            .and_then(Uid::of))
    }

    /// Remove the counter of a deleted mailbox.
    pub async fn forget(&self, mailbox: MailboxId) -> Result<(), Error> {
        self.counter.forget(mailbox).await
    }
}

/// Allocates modseqs.
#[derive(Clone)]
pub struct ModseqProvider {
    counter: SequenceCounter,
}

impl ModseqProvider {
    pub fn new(store: Arc<dyn ColumnStore>, config: &MapperConfig) -> Self {
        Self {
            counter: SequenceCounter {
                directory: MailboxDirectory::new(Arc::clone(&store)),
                store,
                table: Table::ModseqCounter,
                max_attempts: config.max_sequence_retries.max(1),
                limit: u64::MAX,
                exhausted: || Error::ModseqExhausted,
                what: "modseq allocation",
            },
        }
    }

    /// Allocate the next modseq of `mailbox`. The first is 1.
    pub async fn next_modseq(
        &self,
        mailbox: MailboxId,
    ) -> Result<Modseq, Error> {
        self.counter.next(mailbox).await.map(Modseq)
    }

    /// The highest modseq allocated in `mailbox`, or `Modseq::ZERO` if none
    /// has been.
    pub async fn highest_modseq(
        &self,
        mailbox: MailboxId,
    ) -> Result<Modseq, Error> {
        Ok(self
            .counter
            .current(mailbox)
            .await?
            .map_or(Modseq::ZERO, Modseq))
    }

    pub async fn forget(&self, mailbox: MailboxId) -> Result<(), Error> {
        self.counter.forget(mailbox).await
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;
    use crate::storage::MemoryStore;

    async fn mailbox(store: &Arc<dyn ColumnStore>) -> MailboxId {
        let mailbox = Mailbox {
            id: MailboxId::random(),
            path: MailboxPath::for_user("alice", "INBOX").unwrap(),
            uid_validity: UidValidity::random(),
            acl: MailboxAcl::new(),
        };
        MailboxDirectory::new(Arc::clone(store))
            .save(&mailbox)
            .await
            .unwrap();
        mailbox.id
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_sequential_allocation() {
        let store: Arc<dyn ColumnStore> = Arc::new(MemoryStore::new());
        let config = MapperConfig::default();
        let uids = UidProvider::new(Arc::clone(&store), &config);
        let modseqs = ModseqProvider::new(Arc::clone(&store), &config);
        let a = mailbox(&store).await;
        let b = mailbox(&store).await;

        assert_eq!(None, uids.last_uid(a).await.unwrap());
        assert_eq!(Modseq::ZERO, modseqs.highest_modseq(a).await.unwrap());

        assert_eq!(Uid::u(1), uids.next_uid(a).await.unwrap());
        assert_eq!(Uid::u(2), uids.next_uid(a).await.unwrap());
        assert_eq!(Uid::u(1), uids.next_uid(b).await.unwrap());
        assert_eq!(Some(Uid::u(2)), uids.last_uid(a).await.unwrap());

        assert_eq!(Modseq(1), modseqs.next_modseq(a).await.unwrap());
        assert_eq!(Modseq(1), modseqs.highest_modseq(a).await.unwrap());
        assert_eq!(Modseq::ZERO, modseqs.highest_modseq(b).await.unwrap());
    }

    #[test]
    fn sequential_allocation() {
        run_sequential_allocation();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_unknown_mailbox() {
        let store: Arc<dyn ColumnStore> = Arc::new(MemoryStore::new());
        let config = MapperConfig::default();
        let uids = UidProvider::new(Arc::clone(&store), &config);
        let modseqs = ModseqProvider::new(Arc::clone(&store), &config);
        let nx = MailboxId::random();

        assert_matches!(Err(Error::NxMailbox), uids.next_uid(nx).await);
        assert_matches!(Err(Error::NxMailbox), modseqs.next_modseq(nx).await);
        assert_eq!(None, uids.last_uid(nx).await.unwrap());
    }

    #[test]
    fn unknown_mailbox() {
        run_unknown_mailbox();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_leftover_counter_of_deleted_mailbox() {
        let memory = MemoryStore::new();
        let store: Arc<dyn ColumnStore> = Arc::new(memory.clone());
        let uids =
            UidProvider::new(Arc::clone(&store), &MapperConfig::default());
        let a = mailbox(&store).await;
        assert_eq!(Uid::u(1), uids.next_uid(a).await.unwrap());

        MailboxDirectory::new(Arc::clone(&store))
            .delete(a)
            .await
            .unwrap();
        assert_eq!(1, memory.row_count(Table::UidCounter));
        assert_matches!(Err(Error::NxMailbox), uids.next_uid(a).await);
        assert_eq!(Some(Uid::u(1)), uids.last_uid(a).await.unwrap());
    }

    #[test]
    fn leftover_counter_of_deleted_mailbox() {
        run_leftover_counter_of_deleted_mailbox();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_transient_failures_are_retried() {
        let memory = MemoryStore::new();
        let store: Arc<dyn ColumnStore> = Arc::new(memory.clone());
        let config = MapperConfig {
            max_sequence_retries: 3,
            ..MapperConfig::default()
        };
        let uids = UidProvider::new(Arc::clone(&store), &config);
        let a = mailbox(&store).await;

        memory.fail_next_writes(Table::UidCounter, 2);
        assert_eq!(Uid::u(1), uids.next_uid(a).await.unwrap());

        memory.fail_next_writes(Table::UidCounter, 3);
        assert_matches!(
            Err(Error::Contended { attempts: 3, .. }),
            uids.next_uid(a).await
        );
        assert_eq!(Uid::u(2), uids.next_uid(a).await.unwrap());
    }

    #[test]
    fn transient_failures_are_retried() {
        crate::init_test_log();
        run_transient_failures_are_retried();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_uid_exhaustion() {
        let store: Arc<dyn ColumnStore> = Arc::new(MemoryStore::new());
        let uids =
            UidProvider::new(Arc::clone(&store), &MapperConfig::default());
        let a = mailbox(&store).await;

        store
            .write(
                Table::UidCounter,
                &RowKey::single(a.to_key()),
                encode_sequence(u64::from(u32::MAX) - 1),
            )
            .await
            .unwrap();
        assert_eq!(Uid::MAX, uids.next_uid(a).await.unwrap());
        assert_matches!(Err(Error::UidExhausted), uids.next_uid(a).await);
        assert_eq!(Some(Uid::MAX), uids.last_uid(a).await.unwrap());
    }

    #[test]
    fn uid_exhaustion() {
        run_uid_exhaustion();
    }

    async fn allocate_concurrently(workers: usize, per_worker: usize) {
        let store: Arc<dyn ColumnStore> = Arc::new(MemoryStore::new());
        let uids =
            UidProvider::new(Arc::clone(&store), &MapperConfig::default());
        let a = mailbox(&store).await;

        let tasks = (0..workers)
            .map(|_| {
                let uids = uids.clone();
                tokio::spawn(async move {
                    let mut allocated = Vec::with_capacity(per_worker);
                    for _ in 0..per_worker {
                        allocated.push(uids.next_uid(a).await.unwrap());
                    }
                    allocated
                })
            })
            .collect::<Vec<_>>();

        let mut all = BTreeSet::new();
        for task in tasks {
            let allocated = task.await.unwrap();
            // Each worker sees its own allocations in increasing order
            assert!(allocated.windows(2).all(|w| w[0] < w[1]));
            all.extend(allocated);
        }

        assert_eq!(workers * per_worker, all.len());
        assert_eq!(
            Some(Uid::of((workers * per_worker) as u32).unwrap()),
            uids.last_uid(a).await.unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocation_is_distinct() {
        allocate_concurrently(8, 50).await;
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn concurrent_allocation_properties(
            workers in 1usize..8,
            per_worker in 1usize..20,
        ) {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .build()
                .unwrap()
                .block_on(allocate_concurrently(workers, per_worker));
        }
    }
}
