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

//! The derived indexes of the message tables.
//!
//! None of these are authoritative. They are updated after the message
//! tables, one delta per successful write, and are never retried on their
//! own; a lost update leaves an index stale until
//! `repair::RecomputeCountersService` rebuilds the mailbox's counters and UID
//! sets. The applicable flags only ever grow and are not rebuilt.
//!
//! The indexes of one event are updated concurrently and independently: a
//! failure of one does not stop the others.

use std::sync::Arc;

use crate::model::*;
use crate::storage::{ColumnStore, Table};
use crate::support::error::Error;

mod applicable_flags;
mod counters;
mod uid_set;

pub use self::applicable_flags::ApplicableFlagsIndex;
pub use self::counters::{CountersIndex, RawCounters};
pub use self::uid_set::UidSetIndex;

#[derive(Clone)]
pub struct IndexMaintainer {
    counters: CountersIndex,
    recent: UidSetIndex,
    unseen: UidSetIndex,
    deleted: UidSetIndex,
    applicable_flags: ApplicableFlagsIndex,
}

/// Add `uid` to `index` if `member`, or remove it if it is `Some(false)`.
async fn set_membership(
    index: &UidSetIndex,
    mailbox_id: MailboxId,
    uid: Uid,
    member: Option<bool>,
) -> Result<(), Error> {
    match member {
        None => Ok(()),
        Some(true) => index.add(mailbox_id, uid).await,
        Some(false) => index.remove(mailbox_id, uid).await,
    }
}

impl IndexMaintainer {
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        Self {
            counters: CountersIndex::new(Arc::clone(&store)),
            recent: UidSetIndex::new(Arc::clone(&store), Table::Recent),
            unseen: UidSetIndex::new(Arc::clone(&store), Table::FirstUnseen),
            deleted: UidSetIndex::new(Arc::clone(&store), Table::Deleted),
            applicable_flags: ApplicableFlagsIndex::new(store),
        }
    }

    pub fn counters(&self) -> &CountersIndex {
        &self.counters
    }

    /// Account for a message newly placed in its mailbox.
    pub async fn on_add(&self, record: &MessageRecord) -> Result<(), Error> {
        let mailbox_id = record.mailbox_id;
        let uid = record.uid;
        let seen = record.flags.is_seen();

        let (counters, unseen, recent, deleted, applicable_flags) = tokio::join!(
            self.counters.add(mailbox_id, 1, if seen { 0 } else { 1 }),
            set_membership(
                &self.unseen,
                mailbox_id,
                uid,
                (!seen).then_some(true),
            ),
            set_membership(
                &self.recent,
                mailbox_id,
                uid,
                record.flags.is_recent().then_some(true),
            ),
            set_membership(
                &self.deleted,
                mailbox_id,
                uid,
                record.flags.is_deleted().then_some(true),
            ),
            self.applicable_flags.add_all(mailbox_id, &record.flags),
        );
        counters
            .and(unseen)
            .and(recent)
            .and(deleted)
            .and(applicable_flags)
    }

    /// Account for a message removed from its mailbox.
    ///
    /// `record` is the last known state of the message.
    pub async fn on_delete(&self, record: &MessageRecord) -> Result<(), Error> {
        let mailbox_id = record.mailbox_id;
        let uid = record.uid;
        let seen = record.flags.is_seen();

        let (counters, unseen, recent, deleted) = tokio::join!(
            self.counters.add(mailbox_id, -1, if seen { 0 } else { -1 }),
            set_membership(&self.unseen, mailbox_id, uid, Some(false)),
            set_membership(&self.recent, mailbox_id, uid, Some(false)),
            set_membership(&self.deleted, mailbox_id, uid, Some(false)),
        );
        counters.and(unseen).and(recent).and(deleted)
    }

    /// Account for a change of flags on one message.
    pub async fn on_flags_update(
        &self,
        mailbox_id: MailboxId,
        updated: &UpdatedFlags,
    ) -> Result<(), Error> {
        if !updated.flags_changed() {
            return Ok(());
        }

        let uid = updated.uid;
        let became_seen = updated.became(&Flag::Seen);
        let unseen_delta = match became_seen {
            Some(true) => -1,
            Some(false) => 1,
            None => 0,
        };

        let (counters, unseen, recent, deleted, applicable_flags) = tokio::join!(
            self.counters.add(mailbox_id, 0, unseen_delta),
            set_membership(
                &self.unseen,
                mailbox_id,
                uid,
                became_seen.map(|seen| !seen),
            ),
            set_membership(
                &self.recent,
                mailbox_id,
                uid,
                updated.became(&Flag::Recent),
            ),
            set_membership(
                &self.deleted,
                mailbox_id,
                uid,
                updated.became(&Flag::Deleted),
            ),
            self.applicable_flags.add_all(mailbox_id, &updated.new_flags),
        );
        counters
            .and(unseen)
            .and(recent)
            .and(deleted)
            .and(applicable_flags)
    }

    pub async fn mailbox_counters(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<MailboxCounters, Error> {
        self.counters.read(mailbox_id).await
    }

    pub async fn recent_uids(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Vec<Uid>, Error> {
        self.recent.list(mailbox_id, MessageRange::All, None).await
    }

    pub async fn first_unseen(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Option<Uid>, Error> {
        self.unseen.first(mailbox_id).await
    }

    /// UIDs in `range` believed to carry `\Deleted`, at most `limit`.
    pub async fn deleted_uids(
        &self,
        mailbox_id: MailboxId,
        range: MessageRange,
        limit: usize,
    ) -> Result<Vec<Uid>, Error> {
        self.deleted.list(mailbox_id, range, Some(limit)).await
    }

    pub async fn applicable_flags(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Flags, Error> {
        self.applicable_flags.read(mailbox_id).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemoryStore;

    fn record(
        mailbox_id: MailboxId,
        uid: u32,
        flags: &[Flag],
    ) -> MessageRecord {
        MessageRecord {
            mailbox_id,
            message_id: MessageId::random(),
            uid: Uid::u(uid),
            flags: flags.iter().cloned().collect(),
            modseq: Modseq(1),
        }
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_lifecycle() {
        let index = IndexMaintainer::new(Arc::new(MemoryStore::new()));
        let mailbox = MailboxId::random();

        let m1 = record(mailbox, 1, &[Flag::Seen]);
        let m2 = record(mailbox, 2, &[Flag::Recent]);
        let m3 = record(mailbox, 3, &[Flag::Recent, Flag::Deleted]);
        for m in [&m1, &m2, &m3] {
            index.on_add(m).await.unwrap();
        }

        assert_eq!(
            MailboxCounters {
                count: 3,
                unseen: 2
            },
            index.mailbox_counters(mailbox).await.unwrap()
        );
        assert_eq!(
            vec![Uid::u(2), Uid::u(3)],
            index.recent_uids(mailbox).await.unwrap()
        );
        assert_eq!(Some(Uid::u(2)), index.first_unseen(mailbox).await.unwrap());
        assert_eq!(
            vec![Uid::u(3)],
            index
                .deleted_uids(mailbox, MessageRange::All, 10)
                .await
                .unwrap()
        );

        // Mark 2 seen; the first unseen moves forward
        let updated = UpdatedFlags {
            uid: m2.uid,
            message_id: m2.message_id,
            modseq: Modseq(2),
            old_flags: m2.flags.clone(),
            new_flags: Flags::new().with(Flag::Seen),
        };
        index.on_flags_update(mailbox, &updated).await.unwrap();
        assert_eq!(
            MailboxCounters {
                count: 3,
                unseen: 1
            },
            index.mailbox_counters(mailbox).await.unwrap()
        );
        assert_eq!(Some(Uid::u(3)), index.first_unseen(mailbox).await.unwrap());
        assert_eq!(vec![Uid::u(3)], index.recent_uids(mailbox).await.unwrap());

        // Deleting the first unseen scans forward to nothing
        index.on_delete(&m3).await.unwrap();
        assert_eq!(None, index.first_unseen(mailbox).await.unwrap());
        assert_eq!(
            MailboxCounters {
                count: 2,
                unseen: 0
            },
            index.mailbox_counters(mailbox).await.unwrap()
        );
        assert!(index
            .deleted_uids(mailbox, MessageRange::All, 10)
            .await
            .unwrap()
            .is_empty());

        // Applicable flags never shrink
        let flags = index.applicable_flags(mailbox).await.unwrap();
        assert!(flags.contains(&Flag::Seen));
        assert!(flags.contains(&Flag::Deleted));
        assert!(!flags.contains(&Flag::Recent));
    }

    #[test]
    fn lifecycle() {
        run_lifecycle();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_unchanged_flags_touch_nothing() {
        let store = MemoryStore::new();
        let index = IndexMaintainer::new(Arc::new(store.clone()));
        let mailbox = MailboxId::random();
        let updated = UpdatedFlags {
            uid: Uid::u(1),
            message_id: MessageId::random(),
            modseq: Modseq(1),
            old_flags: Flags::new().with(Flag::Seen),
            new_flags: Flags::new().with(Flag::Seen),
        };

        store.fail_next_writes(Table::MailboxCounters, 1);
        index.on_flags_update(mailbox, &updated).await.unwrap();
        assert_eq!(0, store.row_count(Table::ApplicableFlags));
    }

    #[test]
    fn unchanged_flags_touch_nothing() {
        run_unchanged_flags_touch_nothing();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_one_failure_does_not_stop_others() {
        let store = MemoryStore::new();
        let index = IndexMaintainer::new(Arc::new(store.clone()));
        let mailbox = MailboxId::random();

        store.fail_next_writes(Table::Recent, 1);
        assert_matches!(
            Err(Error::Transient(..)),
            index
                .on_add(&record(mailbox, 1, &[Flag::Recent, Flag::Flagged]))
                .await
        );
        assert!(index.recent_uids(mailbox).await.unwrap().is_empty());
        assert_eq!(
            MailboxCounters {
                count: 1,
                unseen: 1
            },
            index.mailbox_counters(mailbox).await.unwrap()
        );
        assert_eq!(Some(Uid::u(1)), index.first_unseen(mailbox).await.unwrap());
        assert!(index
            .applicable_flags(mailbox)
            .await
            .unwrap()
            .contains(&Flag::Flagged));
    }

    #[test]
    fn one_failure_does_not_stop_others() {
        run_one_failure_does_not_stop_others();
    }
}
