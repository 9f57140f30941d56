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

//! Reconciliation of the mailbox directory with the path index.
//!
//! Creating, renaming and deleting a mailbox each write both tables
//! independently, so a failure between the two writes leaves them
//! disagreeing. This job walks both tables and puts back whatever can be
//! derived without guessing. Disagreements that would require picking a
//! winner are only reported.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use log::{error, info, warn};
use serde::Serialize;

use super::context::{ConflictingEntry, Context, RepairReport};
use crate::mailbox::{MailboxDirectory, PathIndex};
use crate::model::*;
use crate::storage::{ColumnStore, SchemaVersion, SchemaVersionStore};
use crate::support::{
    cancel::CancelToken, error::Error, log_prefix::LogPrefix,
};

/// How a pairing of a directory row and a path index row disagrees, if at
/// all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inconsistency {
    NoInconsistency,
    /// The directory has the mailbox, but nothing in the path index points
    /// to it under its path.
    OrphanDirectoryEntry(Mailbox),
    /// The path index points to a mailbox the directory does not have.
    OrphanPathIndexEntry { path: MailboxPath, id: MailboxId },
    /// Both rows exist but name different mailboxes or different paths.
    Conflicting(ConflictingEntry),
}

impl Inconsistency {
    /// Classify a directory row against the path index row for the same
    /// mailbox or path.
    ///
    /// At least one side is expected to be present; two absent sides have
    /// nothing to disagree about.
    pub fn classify(
        directory: Option<&Mailbox>,
        path_entry: Option<(&MailboxPath, MailboxId)>,
    ) -> Self {
        match (directory, path_entry) {
            (None, None) => Inconsistency::NoInconsistency,
            (Some(mailbox), None) => {
                Inconsistency::OrphanDirectoryEntry(mailbox.clone())
            },
            (None, Some((path, id))) => Inconsistency::OrphanPathIndexEntry {
                path: path.clone(),
                id,
            },
            (Some(mailbox), Some((path, id))) => {
                if mailbox.id == id && mailbox.path == *path {
                    Inconsistency::NoInconsistency
                } else {
                    Inconsistency::Conflicting(ConflictingEntry::new(
                        mailbox,
                        path.clone(),
                        id,
                    ))
                }
            },
        }
    }
}

/// The outcome of a repair run or of the handling of a single row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RepairResult {
    /// Every row examined is now consistent.
    Completed,
    /// Some rows were left inconsistent, or the run did not finish.
    Partial,
}

impl RepairResult {
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (RepairResult::Completed, RepairResult::Completed) => {
                RepairResult::Completed
            },
            _ => RepairResult::Partial,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RepairOutcome {
    pub result: RepairResult,
    pub report: RepairReport,
}

pub struct PathRepairService {
    log_prefix: LogPrefix,
    versions: SchemaVersionStore,
    directory: MailboxDirectory,
    path_index: PathIndex,
}

impl PathRepairService {
    pub fn new(log_prefix: LogPrefix, store: Arc<dyn ColumnStore>) -> Self {
        Self {
            log_prefix,
            versions: SchemaVersionStore::new(Arc::clone(&store)),
            directory: MailboxDirectory::new(Arc::clone(&store)),
            path_index: PathIndex::new(store),
        }
    }

    /// Scan both tables and fix what can safely be fixed.
    ///
    /// Fails without touching anything if the path index has not been
    /// back-filled yet, since every mailbox would then look like an orphan.
    /// Otherwise, always returns a report, even if some rows could not be
    /// handled.
    pub async fn run(
        &self,
        cancel: &CancelToken,
    ) -> Result<RepairOutcome, Error> {
        let context = Context::new();
        let result = self.run_with_context(&context, cancel).await?;
        Ok(RepairOutcome {
            result,
            report: context.snapshot(),
        })
    }

    /// Like `run`, but accumulates progress into a caller-provided context
    /// which can be inspected while the run is in progress.
    pub async fn run_with_context(
        &self,
        context: &Context,
        cancel: &CancelToken,
    ) -> Result<RepairResult, Error> {
        self.versions.require(SchemaVersion::PATH_INDEX).await?;

        info!("{} Starting mailbox path repair", self.log_prefix);
        let (directory, path_index) = tokio::join!(
            self.scan_directory(context, cancel),
            self.scan_path_index(context, cancel),
        );
        let result = directory.combine(path_index);

        let report = context.snapshot();
        info!(
            "{} Mailbox path repair finished ({:?}): {} directory rows, \
             {} path rows, {} fixed, {} errors, {} conflicts",
            self.log_prefix,
            result,
            report.processed_directory_entries,
            report.processed_path_entries,
            report.fixed_inconsistencies,
            report.errors,
            report.conflicting_entries.len(),
        );
        Ok(result)
    }

    async fn scan_directory(
        &self,
        context: &Context,
        cancel: &CancelToken,
    ) -> RepairResult {
        self.scan(self.directory.list(), "directory", cancel, |mailbox| {
            async move {
                let result = match self.check_directory_entry(&mailbox).await
                {
                    Ok(inconsistency) => self.fix(inconsistency, context).await,
                    Err(e) => {
                        error!(
                            "{} Failed to check mailbox {} ({}): {}",
                            self.log_prefix, mailbox.id, mailbox.path, e
                        );
                        context.error();
                        RepairResult::Partial
                    },
                };
                context.directory_entry_processed();
                result
            }
        })
        .await
    }

    async fn scan_path_index(
        &self,
        context: &Context,
        cancel: &CancelToken,
    ) -> RepairResult {
        self.scan(self.path_index.list(), "path index", cancel, |(path, id)| {
            async move {
                let result = match self.check_path_entry(&path, id).await {
                    Ok(inconsistency) => self.fix(inconsistency, context).await,
                    Err(e) => {
                        error!(
                            "{} Failed to check path {} -> {}: {}",
                            self.log_prefix, path, id, e
                        );
                        context.error();
                        RepairResult::Partial
                    },
                };
                context.path_entry_processed();
                result
            }
        })
        .await
    }

    /// Drive one table scan, handling rows one at a time.
    ///
    /// A failure of the scan itself ends that scan with a partial result;
    /// failures on individual rows do not.
    async fn scan<T, F, Fut>(
        &self,
        mut rows: BoxStream<'static, Result<T, Error>>,
        what: &str,
        cancel: &CancelToken,
        mut handle: F,
    ) -> RepairResult
    where
        F: FnMut(T) -> Fut,
        Fut: std::future::Future<Output = RepairResult>,
    {
        let mut result = RepairResult::Completed;
        loop {
            if cancel.is_cancelled() {
                info!(
                    "{} Repair cancelled, stopping {} scan",
                    self.log_prefix, what
                );
                return RepairResult::Partial;
            }

            match rows.next().await {
                None => return result,
                Some(Ok(row)) => result = result.combine(handle(row).await),
                Some(Err(e)) => {
                    error!(
                        "{} Error scanning {}, giving up on it: {}",
                        self.log_prefix, what, e
                    );
                    return RepairResult::Partial;
                },
            }
        }
    }

    async fn check_directory_entry(
        &self,
        mailbox: &Mailbox,
    ) -> Result<Inconsistency, Error> {
        let id = self.path_index.retrieve(&mailbox.path).await?;
        Ok(Inconsistency::classify(
            Some(mailbox),
            id.map(|id| (&mailbox.path, id)),
        ))
    }

    async fn check_path_entry(
        &self,
        path: &MailboxPath,
        id: MailboxId,
    ) -> Result<Inconsistency, Error> {
        let mailbox = self.directory.retrieve(id).await?;
        Ok(Inconsistency::classify(mailbox.as_ref(), Some((path, id))))
    }

    async fn fix(
        &self,
        inconsistency: Inconsistency,
        context: &Context,
    ) -> RepairResult {
        match inconsistency {
            Inconsistency::NoInconsistency => RepairResult::Completed,
            Inconsistency::OrphanDirectoryEntry(mailbox) => {
                self.fix_orphan_directory_entry(&mailbox, context).await
            },
            Inconsistency::OrphanPathIndexEntry { path, id } => {
                self.fix_orphan_path_entry(&path, id, context).await
            },
            Inconsistency::Conflicting(entry) => {
                warn!(
                    "{} Mailbox {} at {} conflicts with path index entry \
                     {} -> {}; merge these mailboxes by hand to avoid \
                     losing mail",
                    self.log_prefix,
                    entry.directory.0,
                    entry.directory.1,
                    entry.path_index.0,
                    entry.path_index.1
                );
                context.conflict(entry);
                RepairResult::Partial
            },
        }
    }

    async fn fix_orphan_directory_entry(
        &self,
        mailbox: &Mailbox,
        context: &Context,
    ) -> RepairResult {
        match self.path_index.try_save(&mailbox.path, mailbox.id).await {
            Ok(true) => {
                info!(
                    "{} Restored path index entry {} -> {}",
                    self.log_prefix, mailbox.path, mailbox.id
                );
                context.fixed();
                RepairResult::Completed
            },
            Ok(false) => {
                // Someone claimed the path between the check and now. If it
                // was a create of the same mailbox, there's nothing left to
                // do; otherwise the other scan will see the conflict.
                match self.path_index.retrieve(&mailbox.path).await {
                    Ok(Some(id)) if id == mailbox.id => RepairResult::Completed,
                    Ok(_) => {
                        error!(
                            "{} Path {} of mailbox {} was claimed by another \
                             mailbox during repair",
                            self.log_prefix, mailbox.path, mailbox.id
                        );
                        context.error();
                        RepairResult::Partial
                    },
                    Err(e) => {
                        error!(
                            "{} Failed to re-read path {}: {}",
                            self.log_prefix, mailbox.path, e
                        );
                        context.error();
                        RepairResult::Partial
                    },
                }
            },
            Err(e) => {
                error!(
                    "{} Failed to restore path index entry {} -> {}: {}",
                    self.log_prefix, mailbox.path, mailbox.id, e
                );
                context.error();
                RepairResult::Partial
            },
        }
    }

    async fn fix_orphan_path_entry(
        &self,
        path: &MailboxPath,
        id: MailboxId,
        context: &Context,
    ) -> RepairResult {
        // A mailbox being created claims its path before the directory row
        // is written, so look again before deleting anything.
        match self.directory.retrieve(id).await {
            Ok(None) => {},
            Ok(Some(_)) => return RepairResult::Completed,
            Err(e) => {
                error!(
                    "{} Failed to re-read mailbox {}: {}",
                    self.log_prefix, id, e
                );
                context.error();
                return RepairResult::Partial;
            },
        }

        match self.path_index.delete_if_points_to(path, id).await {
            Ok(true) => {
                info!(
                    "{} Removed dangling path index entry {} -> {}",
                    self.log_prefix, path, id
                );
                context.fixed();
                RepairResult::Completed
            },
            // Already replaced or removed by someone else
            Ok(false) => RepairResult::Completed,
            Err(e) => {
                error!(
                    "{} Failed to remove dangling path index entry \
                     {} -> {}: {}",
                    self.log_prefix, path, id, e
                );
                context.error();
                RepairResult::Partial
            },
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;
    use crate::storage::{MemoryStore, Table};

    struct Setup {
        memory: MemoryStore,
        directory: MailboxDirectory,
        path_index: PathIndex,
        service: PathRepairService,
    }

    impl Setup {
        async fn new() -> Self {
            crate::init_test_log();
            let memory = MemoryStore::new();
            let store: Arc<dyn ColumnStore> = Arc::new(memory.clone());
            SchemaVersionStore::new(Arc::clone(&store))
                .record(SchemaVersion::PATH_INDEX)
                .await
                .unwrap();

            Setup {
                memory,
                directory: MailboxDirectory::new(Arc::clone(&store)),
                path_index: PathIndex::new(Arc::clone(&store)),
                service: PathRepairService::new(
                    LogPrefix::new("repair".to_owned()),
                    store,
                ),
            }
        }

        async fn run(&self) -> RepairOutcome {
            self.service.run(&CancelToken::new()).await.unwrap()
        }
    }

    fn mailbox(name: &str) -> Mailbox {
        Mailbox {
            id: MailboxId::random(),
            path: MailboxPath::for_user("user", name).unwrap(),
            uid_validity: UidValidity::random(),
            acl: MailboxAcl::new(),
        }
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_orphan_directory_entry_restored() {
        let setup = Setup::new().await;
        let inbox = mailbox("INBOX");
        // The path index write was lost
        setup.directory.save(&inbox).await.unwrap();

        let outcome = setup.run().await;
        assert_eq!(RepairResult::Completed, outcome.result);
        assert_eq!(1, outcome.report.processed_directory_entries);
        assert_eq!(1, outcome.report.fixed_inconsistencies);
        assert_eq!(0, outcome.report.errors);
        assert!(outcome.report.conflicting_entries.is_empty());
        assert_eq!(
            Some(inbox.id),
            setup.path_index.retrieve(&inbox.path).await.unwrap()
        );

        let again = setup.run().await;
        assert_eq!(RepairResult::Completed, again.result);
        assert_eq!(0, again.report.fixed_inconsistencies);
        assert_eq!(1, again.report.processed_directory_entries);
        assert_eq!(1, again.report.processed_path_entries);
    }

    #[test]
    fn orphan_directory_entry_restored() {
        run_orphan_directory_entry_restored();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_orphan_path_entry_removed() {
        let setup = Setup::new().await;
        let inbox = mailbox("INBOX");
        setup.directory.save(&inbox).await.unwrap();
        setup.path_index.save(&inbox.path, inbox.id).await.unwrap();
        // The path row survived the deletion of its mailbox
        let gone = mailbox("Trash");
        setup.path_index.save(&gone.path, gone.id).await.unwrap();

        let outcome = setup.run().await;
        assert_eq!(RepairResult::Completed, outcome.result);
        assert_eq!(1, outcome.report.processed_directory_entries);
        assert_eq!(2, outcome.report.processed_path_entries);
        assert_eq!(1, outcome.report.fixed_inconsistencies);
        assert_eq!(0, outcome.report.errors);
        assert_eq!(None, setup.path_index.retrieve(&gone.path).await.unwrap());
        assert_eq!(
            Some(inbox.id),
            setup.path_index.retrieve(&inbox.path).await.unwrap()
        );

        let again = setup.run().await;
        assert_eq!(0, again.report.fixed_inconsistencies);
        assert_eq!(1, again.report.processed_path_entries);
    }

    #[test]
    fn orphan_path_entry_removed() {
        run_orphan_path_entry_removed();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_conflicts_are_reported_not_fixed() {
        let setup = Setup::new().await;
        // Two directory rows claim the same path, and the path index sides
        // with the second.
        let first = mailbox("INBOX");
        let second = Mailbox {
            id: MailboxId::random(),
            ..first.clone()
        };
        setup.directory.save(&first).await.unwrap();
        setup.directory.save(&second).await.unwrap();
        setup.path_index.save(&first.path, second.id).await.unwrap();

        for _ in 0..2 {
            let outcome = setup.run().await;
            assert_eq!(RepairResult::Partial, outcome.result);
            assert_eq!(0, outcome.report.fixed_inconsistencies);
            assert_eq!(0, outcome.report.errors);
            assert_eq!(
                vec![ConflictingEntry::new(
                    &first,
                    first.path.clone(),
                    second.id
                )],
                outcome.report.conflicting_entries
            );

            assert_eq!(2, setup.memory.row_count(Table::Mailbox));
            assert_eq!(1, setup.memory.row_count(Table::MailboxPath));
            assert_eq!(
                Some(second.id),
                setup.path_index.retrieve(&first.path).await.unwrap()
            );
        }
    }

    #[test]
    fn conflicts_are_reported_not_fixed() {
        run_conflicts_are_reported_not_fixed();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_requires_backfilled_path_index() {
        crate::init_test_log();
        let memory = MemoryStore::new();
        let store: Arc<dyn ColumnStore> = Arc::new(memory.clone());
        let directory = MailboxDirectory::new(Arc::clone(&store));
        directory.save(&mailbox("INBOX")).await.unwrap();
        let versions = SchemaVersionStore::new(Arc::clone(&store));
        versions.record(SchemaVersion::BASE).await.unwrap();

        let service =
            PathRepairService::new(LogPrefix::new("repair".to_owned()), store);
        assert_matches!(
            Err(Error::SchemaVersionTooOld {
                required: 2,
                current: Some(1),
            }),
            service.run(&CancelToken::new()).await
        );
        // Nothing was touched
        assert_eq!(0, memory.row_count(Table::MailboxPath));
    }

    #[test]
    fn requires_backfilled_path_index() {
        run_requires_backfilled_path_index();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_cancelled_run_is_partial() {
        let setup = Setup::new().await;
        for name in &["INBOX", "Sent", "Drafts"] {
            setup.directory.save(&mailbox(name)).await.unwrap();
        }

        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = setup.service.run(&cancel).await.unwrap();
        assert_eq!(RepairResult::Partial, outcome.result);
        assert_eq!(0, outcome.report.processed_directory_entries);
        assert_eq!(0, outcome.report.processed_path_entries);
        assert_eq!(0, setup.memory.row_count(Table::MailboxPath));
    }

    #[test]
    fn cancelled_run_is_partial() {
        run_cancelled_run_is_partial();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_row_errors_are_counted() {
        let setup = Setup::new().await;
        let inbox = mailbox("INBOX");
        let sent = mailbox("Sent");
        setup.directory.save(&inbox).await.unwrap();
        setup.directory.save(&sent).await.unwrap();

        setup.memory.fail_next_writes(Table::MailboxPath, 1);
        let outcome = setup.run().await;
        assert_eq!(RepairResult::Partial, outcome.result);
        assert_eq!(2, outcome.report.processed_directory_entries);
        assert_eq!(1, outcome.report.fixed_inconsistencies);
        assert_eq!(1, outcome.report.errors);

        let again = setup.run().await;
        assert_eq!(RepairResult::Completed, again.result);
        assert_eq!(1, again.report.fixed_inconsistencies);
        assert_eq!(0, again.report.errors);
        assert_eq!(
            Some(inbox.id),
            setup.path_index.retrieve(&inbox.path).await.unwrap()
        );
        assert_eq!(
            Some(sent.id),
            setup.path_index.retrieve(&sent.path).await.unwrap()
        );
    }

    #[test]
    fn row_errors_are_counted() {
        run_row_errors_are_counted();
    }

    #[test]
    fn result_combination() {
        use RepairResult::*;
        assert_eq!(Completed, Completed.combine(Completed));
        assert_eq!(Partial, Completed.combine(Partial));
        assert_eq!(Partial, Partial.combine(Completed));
        assert_eq!(Partial, Partial.combine(Partial));
    }

    fn arb_mailbox() -> impl Strategy<Value = Option<Mailbox>> {
        prop::option::of((0..3usize, 0..3usize)).prop_map(|choice| {
            choice.map(|(id, name)| Mailbox {
                id: ids()[id],
                path: MailboxPath::for_user("user", &format!("box{}", name))
                    .unwrap(),
                uid_validity: UidValidity(1),
                acl: MailboxAcl::new(),
            })
        })
    }

    fn ids() -> [MailboxId; 3] {
        use uuid::Uuid;
        [
            MailboxId(Uuid::from_u128(1)),
            MailboxId(Uuid::from_u128(2)),
            MailboxId(Uuid::from_u128(3)),
        ]
    }

    proptest! {
        #[test]
        fn classification_is_total_and_exclusive(
            directory in arb_mailbox(),
            entry in prop::option::of((0..3usize, 0..3usize)),
        ) {
            let entry = entry.map(|(name, id)| {
                (
                    MailboxPath::for_user("user", &format!("box{}", name))
                        .unwrap(),
                    ids()[id],
                )
            });
            let classified = Inconsistency::classify(
                directory.as_ref(),
                entry.as_ref().map(|&(ref path, id)| (path, id)),
            );

            let consistent = match (&directory, &entry) {
                (Some(m), Some((p, id))) => m.id == *id && m.path == *p,
                (None, None) => true,
                _ => false,
            };
            let orphan_directory = directory.is_some() && entry.is_none();
            let orphan_path = directory.is_none() && entry.is_some();
            let conflicting = directory.is_some()
                && entry.is_some()
                && !consistent;

            prop_assert_eq!(
                1,
                [consistent, orphan_directory, orphan_path, conflicting]
                    .iter()
                    .filter(|&&b| b)
                    .count()
            );
            match classified {
                Inconsistency::NoInconsistency => prop_assert!(consistent),
                Inconsistency::OrphanDirectoryEntry(ref m) => {
                    prop_assert!(orphan_directory);
                    prop_assert_eq!(directory.as_ref(), Some(m));
                },
                Inconsistency::OrphanPathIndexEntry { ref path, id } => {
                    prop_assert!(orphan_path);
                    prop_assert_eq!(entry.as_ref(), Some(&(path.clone(), id)));
                },
                Inconsistency::Conflicting(_) => prop_assert!(conflicting),
            }
        }
    }
}
