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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::model::*;

/// A directory row and a path index row which disagree with each other in a
/// way that cannot be resolved automatically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ConflictingEntry {
    /// The mailbox as recorded in the directory.
    pub directory: (MailboxId, MailboxPath),
    /// The path index entry that disagrees with it.
    pub path_index: (MailboxPath, MailboxId),
}

impl ConflictingEntry {
    pub fn new(
        mailbox: &Mailbox,
        path: MailboxPath,
        path_id: MailboxId,
    ) -> Self {
        Self {
            directory: (mailbox.id, mailbox.path.clone()),
            path_index: (path, path_id),
        }
    }
}

/// Progress of a repair run, shared by its concurrent scans.
///
/// The same conflict is usually found by both scans; it is only recorded
/// once.
#[derive(Debug, Default)]
pub struct Context {
    processed_directory_entries: AtomicU64,
    processed_path_entries: AtomicU64,
    fixed_inconsistencies: AtomicU64,
    errors: AtomicU64,
    conflicts: Mutex<BTreeSet<ConflictingEntry>>,
}

/// A point-in-time copy of a `Context`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub processed_directory_entries: u64,
    pub processed_path_entries: u64,
    pub fixed_inconsistencies: u64,
    pub errors: u64,
    pub conflicting_entries: Vec<ConflictingEntry>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn directory_entry_processed(&self) {
        self.processed_directory_entries
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn path_entry_processed(&self) {
        self.processed_path_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fixed(&self) {
        self.fixed_inconsistencies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conflict(&self, entry: ConflictingEntry) {
        self.conflicts.lock().unwrap().insert(entry);
    }

    pub fn snapshot(&self) -> RepairReport {
        RepairReport {
            processed_directory_entries: self
                .processed_directory_entries
                .load(Ordering::Relaxed),
            processed_path_entries: self
                .processed_path_entries
                .load(Ordering::Relaxed),
            fixed_inconsistencies: self
                .fixed_inconsistencies
                .load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            conflicting_entries: self
                .conflicts
                .lock()
                .unwrap()
                .iter()
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conflicts_are_deduplicated() {
        let mailbox = Mailbox {
            id: MailboxId::random(),
            path: MailboxPath::for_user("bob", "INBOX").unwrap(),
            uid_validity: UidValidity::random(),
            acl: MailboxAcl::new(),
        };
        let other = MailboxId::random();

        let context = Context::new();
        context.directory_entry_processed();
        context.path_entry_processed();
        context.path_entry_processed();
        context.fixed();
        context.conflict(ConflictingEntry::new(
            &mailbox,
            mailbox.path.clone(),
            other,
        ));
        context.conflict(ConflictingEntry::new(
            &mailbox,
            mailbox.path.clone(),
            other,
        ));

        let report = context.snapshot();
        assert_eq!(1, report.processed_directory_entries);
        assert_eq!(2, report.processed_path_entries);
        assert_eq!(1, report.fixed_inconsistencies);
        assert_eq!(0, report.errors);
        assert_eq!(1, report.conflicting_entries.len());
    }
}
