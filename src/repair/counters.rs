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

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::TryStreamExt;
use log::info;
use serde::Serialize;

use crate::mailbox::MailboxDirectory;
use crate::message::index::{CountersIndex, RawCounters, UidSetIndex};
use crate::message::ByUidTable;
use crate::model::*;
use crate::storage::{ColumnStore, Table};
use crate::support::{error::Error, log_prefix::LogPrefix};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RecomputeReport {
    /// The counter cells before recomputation.
    pub previous: (i64, i64),
    /// The counts derived from the message table.
    pub recomputed: MailboxCounters,
    /// UIDs added to or removed from the unseen, recent, and deleted sets.
    pub corrected_memberships: u64,
}

/// One of the UID set indexes and the flag condition it tracks.
struct DerivedUidSet {
    name: &'static str,
    index: UidSetIndex,
    member: fn(&Flags) -> bool,
}

/// What a scan of the by-uid table says the indexes should hold.
#[derive(Default)]
struct Derived {
    counters: MailboxCounters,
    /// Indexed like `RecomputeCountersService::uid_sets`.
    members: [BTreeSet<Uid>; 3],
}

/// Re-derives the counters and UID set indexes of a mailbox from the by-uid
/// message table.
///
/// Counters are cells updated by deltas, so the correction is applied as a
/// delta too. Messages added or removed concurrently with a recomputation
/// may be counted twice or not at all, and their set memberships may be
/// wrong; run it again once the mailbox is quiet if that matters.
pub struct RecomputeCountersService {
    log_prefix: LogPrefix,
    directory: MailboxDirectory,
    by_uid: ByUidTable,
    counters: CountersIndex,
    uid_sets: [DerivedUidSet; 3],
}

impl RecomputeCountersService {
    pub fn new(log_prefix: LogPrefix, store: Arc<dyn ColumnStore>) -> Self {
        Self {
            log_prefix,
            directory: MailboxDirectory::new(Arc::clone(&store)),
            by_uid: ByUidTable::new(Arc::clone(&store)),
            counters: CountersIndex::new(Arc::clone(&store)),
            uid_sets: [
                DerivedUidSet {
                    name: "unseen",
                    index: UidSetIndex::new(
                        Arc::clone(&store),
                        Table::FirstUnseen,
                    ),
                    member: |flags| !flags.is_seen(),
                },
                DerivedUidSet {
                    name: "recent",
                    index: UidSetIndex::new(Arc::clone(&store), Table::Recent),
                    member: Flags::is_recent,
                },
                DerivedUidSet {
                    name: "deleted",
                    index: UidSetIndex::new(store, Table::Deleted),
                    member: Flags::is_deleted,
                },
            ],
        }
    }

    pub async fn recompute(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<RecomputeReport, Error> {
        if self.directory.retrieve(mailbox_id).await?.is_none() {
            return Err(Error::NxMailbox);
        }

        let uid_sets = &self.uid_sets;
        let derived = self
            .by_uid
            .retrieve_range(mailbox_id, MessageRange::All)
            .try_fold(Derived::default(), |mut acc, record| async move {
                acc.counters.count += 1;
                if !record.flags.is_seen() {
                    acc.counters.unseen += 1;
                }
                for (set, members) in uid_sets.iter().zip(&mut acc.members) {
                    if (set.member)(&record.flags) {
                        members.insert(record.uid);
                    }
                }
                Ok(acc)
            })
            .await?;
        let recomputed = derived.counters;

        let previous = self.counters.read_raw(mailbox_id).await?;
        let target = RawCounters {
            count: recomputed.count as i64,
            unseen: recomputed.unseen as i64,
        };
        if previous != target {
            info!(
                "{} Correcting counters of {}: count {} -> {}, unseen {} -> {}",
                self.log_prefix,
                mailbox_id,
                previous.count,
                target.count,
                previous.unseen,
                target.unseen
            );
            self.counters
                .add(
                    mailbox_id,
                    target.count - previous.count,
                    target.unseen - previous.unseen,
                )
                .await?;
        }

        let mut corrected_memberships = 0;
        for (set, members) in self.uid_sets.iter().zip(&derived.members) {
            corrected_memberships +=
                self.rebuild(set, mailbox_id, members).await?;
        }

        Ok(RecomputeReport {
            previous: (previous.count, previous.unseen),
            recomputed,
            corrected_memberships,
        })
    }

    /// Make `set` hold exactly `expected` for `mailbox_id`.
    async fn rebuild(
        &self,
        set: &DerivedUidSet,
        mailbox_id: MailboxId,
        expected: &BTreeSet<Uid>,
    ) -> Result<u64, Error> {
        let current = set
            .index
            .list(mailbox_id, MessageRange::All, None)
            .await?
            .into_iter()
            .collect::<BTreeSet<Uid>>();

        let mut corrected = 0;
        for &uid in expected.difference(&current) {
            set.index.add(mailbox_id, uid).await?;
            corrected += 1;
        }
        for &uid in current.difference(expected) {
            set.index.remove(mailbox_id, uid).await?;
            corrected += 1;
        }

        if corrected > 0 {
            info!(
                "{} Corrected {} entries of the {} index of {}",
                self.log_prefix, corrected, set.name, mailbox_id
            );
        }
        Ok(corrected)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::test_support::Fixture;
    use crate::support::system_config::MapperConfig;

    #[tokio::main(flavor = "current_thread")]
    async fn run_recompute_corrects_drift() {
        let fixture = Fixture::new(MapperConfig::default());
        let inbox = fixture.mailbox("INBOX").await;
        fixture.add(inbox, &[Flag::Seen]).await;
        fixture.add(inbox, &[]).await;
        // Lose the counter updates of the third message
        fixture
            .store
            .memory()
            .fail_next_writes(Table::MailboxCounters, 2);
        fixture.add(inbox, &[Flag::Flagged]).await;

        let service = RecomputeCountersService::new(
            LogPrefix::new("recompute".to_owned()),
            Arc::new(fixture.store.clone()),
        );
        let report = service.recompute(inbox).await.unwrap();
        assert_eq!((2, 1), report.previous);
        assert_eq!(
            MailboxCounters {
                count: 3,
                unseen: 2,
            },
            report.recomputed
        );
        assert_eq!(
            report.recomputed,
            fixture.mapper.mailbox_counters(inbox).await.unwrap()
        );

        assert_eq!(0, report.corrected_memberships);

        let again = service.recompute(inbox).await.unwrap();
        assert_eq!((3, 2), again.previous);

        assert_matches!(
            Err(Error::NxMailbox),
            service.recompute(MailboxId::random()).await
        );
    }

    #[test]
    fn recompute_corrects_drift() {
        run_recompute_corrects_drift();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_recompute_rebuilds_uid_sets() {
        let fixture = Fixture::new(MapperConfig::default());
        let memory = fixture.store.memory();
        let inbox = fixture.mailbox("INBOX").await;

        let m1 = fixture.add(inbox, &[]).await;
        // m2 is missing from the unseen and recent sets
        memory.fail_next_writes(Table::FirstUnseen, 1);
        memory.fail_next_writes(Table::Recent, 1);
        let m2 = fixture.add(inbox, &[Flag::Recent]).await;
        // m3 stays in the deleted set after losing \Deleted
        let m3 = fixture.add(inbox, &[Flag::Deleted]).await;
        memory.fail_next_writes(Table::Deleted, 1);
        fixture
            .mapper
            .update_flags(
                inbox,
                FlagsUpdateCalculator::new(
                    FlagsUpdateMode::Remove,
                    Flags::new().with(Flag::Deleted),
                ),
                MessageRange::All,
            )
            .await
            .unwrap();
        assert!(fixture
            .mapper
            .find_recent_uids(inbox)
            .await
            .unwrap()
            .is_empty());

        let service = RecomputeCountersService::new(
            LogPrefix::new("recompute".to_owned()),
            Arc::new(fixture.store.clone()),
        );
        let report = service.recompute(inbox).await.unwrap();
        assert_eq!((3, 3), report.previous);
        assert_eq!(3, report.corrected_memberships);

        assert_eq!(
            vec![m2.uid],
            fixture.mapper.find_recent_uids(inbox).await.unwrap()
        );
        assert_eq!(
            Some(m1.uid),
            fixture.mapper.find_first_unseen_uid(inbox).await.unwrap()
        );
        fixture.mapper.delete(inbox, m1.uid).await.unwrap();
        assert_eq!(
            Some(m2.uid),
            fixture.mapper.find_first_unseen_uid(inbox).await.unwrap()
        );
        assert!(fixture
            .mapper
            .expunge_marked_for_deletion(inbox, MessageRange::All)
            .await
            .unwrap()
            .is_empty());
        assert!(fixture
            .mapper
            .retrieve(inbox, m3.uid)
            .await
            .unwrap()
            .is_some());

        assert_eq!(
            0,
            service.recompute(inbox).await.unwrap().corrected_memberships
        );
    }

    #[test]
    fn recompute_rebuilds_uid_sets() {
        run_recompute_rebuilds_uid_sets();
    }
}
