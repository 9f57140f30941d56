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

//! Upgrades of the logical schema of a store.
//!
//! Each step brings the data in line with one `SchemaVersion` and records it
//! only once it has fully succeeded, so an interrupted migration is simply
//! run again.

use std::sync::Arc;

use futures::TryStreamExt;
use log::{info, warn};

use crate::mailbox::{MailboxDirectory, PathIndex};
use crate::storage::{ColumnStore, SchemaVersion, SchemaVersionStore};
use crate::support::{error::Error, log_prefix::LogPrefix};

/// What a path index back-fill did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Directory rows examined.
    pub scanned: u64,
    /// Path index rows written.
    pub written: u64,
    /// Directory rows whose path was already claimed by another mailbox.
    pub conflicts: u64,
}

pub struct Migrations {
    log_prefix: LogPrefix,
    versions: SchemaVersionStore,
    directory: MailboxDirectory,
    path_index: PathIndex,
}

impl Migrations {
    pub fn new(log_prefix: LogPrefix, store: Arc<dyn ColumnStore>) -> Self {
        Self {
            log_prefix,
            versions: SchemaVersionStore::new(Arc::clone(&store)),
            directory: MailboxDirectory::new(Arc::clone(&store)),
            path_index: PathIndex::new(store),
        }
    }

    /// Apply every step between the current version and `target`.
    ///
    /// Returns the version the store ends up at.
    pub async fn migrate_to(
        &self,
        target: SchemaVersion,
    ) -> Result<SchemaVersion, Error> {
        let mut current = self.versions.current().await?;

        while current.map_or(true, |c| c < target) {
            let next = current.map_or(SchemaVersion::BASE, |c| {
                SchemaVersion(c.0 + 1)
            });
            info!("{} Migrating store to schema {}", self.log_prefix, next);
            self.apply(next).await?;
            self.versions.record(next).await?;
            current = Some(next);
        }

        Ok(current.unwrap_or(target))
    }

    async fn apply(&self, version: SchemaVersion) -> Result<(), Error> {
        match version {
            SchemaVersion::BASE => Ok(()),
            SchemaVersion::PATH_INDEX => {
                let report = self.backfill_path_index().await?;
                info!(
                    "{} Path index back-fill: {} mailboxes scanned, {} paths \
                     written, {} conflicts",
                    self.log_prefix,
                    report.scanned,
                    report.written,
                    report.conflicts
                );
                Ok(())
            },
            SchemaVersion(unknown) => Err(Error::SchemaVersionTooOld {
                required: unknown,
                current: Some(SchemaVersion::LATEST.0),
            }),
        }
    }

    /// Give every mailbox in the directory a path index entry, without
    /// replacing any existing entry.
    pub async fn backfill_path_index(&self) -> Result<BackfillReport, Error> {
        let mut report = BackfillReport::default();
        let mut mailboxes = self.directory.list();

        while let Some(mailbox) = mailboxes.try_next().await? {
            report.scanned += 1;
            if self.path_index.try_save(&mailbox.path, mailbox.id).await? {
                report.written += 1;
            } else if Some(mailbox.id)
                != self.path_index.retrieve(&mailbox.path).await?
            {
                warn!(
                    "{} Mailbox {} claims path {}, which belongs to another \
                     mailbox",
                    self.log_prefix, mailbox.id, mailbox.path
                );
                report.conflicts += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::*;
    use crate::storage::{MemoryStore, Table};

    fn mailbox(name: &str) -> Mailbox {
        Mailbox {
            id: MailboxId::random(),
            path: MailboxPath::for_user("alice", name).unwrap(),
            uid_validity: UidValidity::random(),
            acl: MailboxAcl::new(),
        }
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_migrate_from_scratch() {
        crate::init_test_log();
        let memory = MemoryStore::new();
        let store: Arc<dyn ColumnStore> = Arc::new(memory.clone());
        let directory = MailboxDirectory::new(Arc::clone(&store));
        let path_index = PathIndex::new(Arc::clone(&store));
        let versions = SchemaVersionStore::new(Arc::clone(&store));

        // Mailboxes from before the path index existed
        let inbox = mailbox("INBOX");
        let sent = mailbox("Sent");
        directory.save(&inbox).await.unwrap();
        directory.save(&sent).await.unwrap();
        // One already indexed, one conflicting
        path_index.save(&sent.path, sent.id).await.unwrap();
        let impostor = Mailbox {
            id: MailboxId::random(),
            ..inbox.clone()
        };
        directory.save(&impostor).await.unwrap();

        let migrations =
            Migrations::new(LogPrefix::new("migrate".to_owned()), store);

        // A failed back-fill records nothing past the base version
        memory.fail_next_writes(Table::MailboxPath, 1);
        assert_matches!(
            Err(Error::Transient(..)),
            migrations.migrate_to(SchemaVersion::LATEST).await
        );
        assert_eq!(
            Some(SchemaVersion::BASE),
            versions.current().await.unwrap()
        );

        assert_eq!(
            SchemaVersion::LATEST,
            migrations.migrate_to(SchemaVersion::LATEST).await.unwrap()
        );
        assert_eq!(
            Some(SchemaVersion::PATH_INDEX),
            versions.current().await.unwrap()
        );
        assert_eq!(
            Some(sent.id),
            path_index.retrieve(&sent.path).await.unwrap()
        );
        let owner = path_index.retrieve(&inbox.path).await.unwrap().unwrap();
        assert!(owner == inbox.id || owner == impostor.id);

        // Already there
        assert_eq!(
            SchemaVersion::LATEST,
            migrations.migrate_to(SchemaVersion::LATEST).await.unwrap()
        );

        let report = migrations.backfill_path_index().await.unwrap();
        assert_eq!(
            BackfillReport {
                scanned: 3,
                written: 0,
                conflicts: 1,
            },
            report
        );
    }

    #[test]
    fn migrate_from_scratch() {
        run_migrate_from_scratch();
    }
}
