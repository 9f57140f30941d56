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

//! The column-store client contract.
//!
//! This is the only interface the rest of the crate has to persistence. It
//! models a wide-column store of the Cassandra family: rows are grouped into
//! partitions, ordered within a partition by a clustering key, and the only
//! atomic operations are on single rows. There are no multi-row transactions.

use std::ops::Bound;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::support::error::Error;

/// The tables of the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// Mailbox directory, by mailbox ID.
    Mailbox,
    /// Path index, by (namespace, user) then mailbox name.
    MailboxPath,
    /// Last allocated UID, by mailbox ID.
    UidCounter,
    /// Last allocated modseq, by mailbox ID.
    ModseqCounter,
    /// Message metadata, by mailbox ID then UID.
    MessageByUid,
    /// Message metadata, by message ID then mailbox ID.
    MessageById,
    /// Message content information, by message ID.
    MessageContent,
    /// Message and unseen counters, by mailbox ID. Counter cells only.
    MailboxCounters,
    /// UIDs carrying `\Recent`, by mailbox ID then UID.
    Recent,
    /// UIDs lacking `\Seen`, by mailbox ID then UID.
    FirstUnseen,
    /// UIDs carrying `\Deleted`, by mailbox ID then UID.
    Deleted,
    /// Every flag ever seen in a mailbox, by mailbox ID then flag.
    ApplicableFlags,
    /// Applied schema versions.
    SchemaVersion,
}

impl Table {
    pub const ALL: [Table; 13] = [
        Table::Mailbox,
        Table::MailboxPath,
        Table::UidCounter,
        Table::ModseqCounter,
        Table::MessageByUid,
        Table::MessageById,
        Table::MessageContent,
        Table::MailboxCounters,
        Table::Recent,
        Table::FirstUnseen,
        Table::Deleted,
        Table::ApplicableFlags,
        Table::SchemaVersion,
    ];

    /// The stable name of the table in persistent storage.
    pub fn name(self) -> &'static str {
        match self {
            Table::Mailbox => "mailbox",
            Table::MailboxPath => "mailbox_path",
            Table::UidCounter => "uid_counter",
            Table::ModseqCounter => "modseq_counter",
            Table::MessageByUid => "message_by_uid",
            Table::MessageById => "message_by_id",
            Table::MessageContent => "message_content",
            Table::MailboxCounters => "mailbox_counters",
            Table::Recent => "recent",
            Table::FirstUnseen => "first_unseen",
            Table::Deleted => "deleted",
            Table::ApplicableFlags => "applicable_flags",
            Table::SchemaVersion => "schema_version",
        }
    }
}

/// The address of a single row.
///
/// Keys compare byte-wise, which is the clustering order within a partition.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub partition: Vec<u8>,
    pub clustering: Vec<u8>,
}

impl RowKey {
    pub fn new(partition: Vec<u8>, clustering: Vec<u8>) -> Self {
        Self {
            partition,
            clustering,
        }
    }

    /// A key for a table with exactly one row per partition.
    pub fn single(partition: Vec<u8>) -> Self {
        Self::new(partition, Vec::new())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub key: RowKey,
    pub value: Vec<u8>,
}

pub type RowStream = BoxStream<'static, Result<Row, Error>>;

/// A client to the column store.
///
/// Every method is a single request against a single row, except the two
/// streaming reads. A stream reflects the table at some point during its
/// iteration; it is not a snapshot.
///
/// Counter cells (`increment` / `read_counter`) live in a separate space from
/// ordinary rows, as in Cassandra, and are not visible to `scan` or
/// `read_range`.
#[async_trait]
pub trait ColumnStore: Send + Sync {
    /// Read the value of one row.
    async fn read(
        &self,
        table: Table,
        key: &RowKey,
    ) -> Result<Option<Vec<u8>>, Error>;

    /// Unconditionally write one row.
    async fn write(
        &self,
        table: Table,
        key: &RowKey,
        value: Vec<u8>,
    ) -> Result<(), Error>;

    /// Unconditionally delete one row. Deleting a row which does not exist is
    /// not an error.
    async fn delete(&self, table: Table, key: &RowKey) -> Result<(), Error>;

    /// Atomically replace one row if its current value is `expected`.
    ///
    /// `expected == None` requires the row to not exist ("IF NOT EXISTS").
    /// `new == None` deletes the row.
    ///
    /// Returns whether the write happened. A `false` return means the row had
    /// some other value and nothing was changed.
    async fn compare_and_set(
        &self,
        table: Table,
        key: &RowKey,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, Error>;

    /// Add `delta` to a counter cell, creating it at 0 if needed.
    async fn increment(
        &self,
        table: Table,
        key: &RowKey,
        delta: i64,
    ) -> Result<(), Error>;

    /// Read a counter cell.
    async fn read_counter(
        &self,
        table: Table,
        key: &RowKey,
    ) -> Result<Option<i64>, Error>;

    /// Read rows of one partition whose clustering key is within the given
    /// bounds, in clustering order.
    fn read_range(
        &self,
        table: Table,
        partition: &[u8],
        from: Bound<&[u8]>,
        to: Bound<&[u8]>,
        limit: Option<usize>,
    ) -> RowStream;

    /// Iterate over every row of the table, in no particular order.
    fn scan(&self, table: Table) -> RowStream;
}

/// Whether `clustering` is within the given bounds.
pub fn in_bounds(
    clustering: &[u8],
    from: Bound<&[u8]>,
    to: Bound<&[u8]>,
) -> bool {
    let above = match from {
        Bound::Included(from) => clustering >= from,
        Bound::Excluded(from) => clustering > from,
        Bound::Unbounded => true,
    };
    let below = match to {
        Bound::Included(to) => clustering <= to,
        Bound::Excluded(to) => clustering < to,
        Bound::Unbounded => true,
    };
    above && below
}
