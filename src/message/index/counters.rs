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

use std::sync::Arc;

use crate::model::*;
use crate::storage::codec::{counter_value, KeyComponent};
use crate::storage::{ColumnStore, RowKey, Table};
use crate::support::error::Error;

const COUNT: &[u8] = b"count";
const UNSEEN: &[u8] = b"unseen";

/// The raw value of the two counter cells of a mailbox.
///
/// These can be negative if decrements were applied for messages whose
/// increments were lost.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawCounters {
    pub count: i64,
    pub unseen: i64,
}

impl RawCounters {
    pub fn clamped(self) -> MailboxCounters {
        MailboxCounters {
            count: counter_value(Some(self.count)),
            unseen: counter_value(Some(self.unseen)),
        }
    }
}

/// Message and unseen counts per mailbox, maintained by deltas.
#[derive(Clone)]
pub struct CountersIndex {
    store: Arc<dyn ColumnStore>,
}

fn key(mailbox_id: MailboxId, cell: &[u8]) -> RowKey {
    RowKey::new(mailbox_id.to_key(), cell.to_vec())
}

impl CountersIndex {
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        Self { store }
    }

    /// Apply the given deltas. Zero deltas are not written.
    pub async fn add(
        &self,
        mailbox_id: MailboxId,
        count: i64,
        unseen: i64,
    ) -> Result<(), Error> {
        let increment = |cell: &'static [u8], delta: i64| {
            let key = key(mailbox_id, cell);
            async move {
                if 0 == delta {
                    Ok(())
                } else {
                    self.store
                        .increment(Table::MailboxCounters, &key, delta)
                        .await
                }
            }
        };

        let (count, unseen) =
            tokio::join!(increment(COUNT, count), increment(UNSEEN, unseen));
        count.and(unseen)
    }

    pub async fn read_raw(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<RawCounters, Error> {
        let count_key = key(mailbox_id, COUNT);
        let unseen_key = key(mailbox_id, UNSEEN);
        let (count, unseen) = tokio::try_join!(
            self.store.read_counter(Table::MailboxCounters, &count_key),
            self.store.read_counter(Table::MailboxCounters, &unseen_key),
        )?;

        Ok(RawCounters {
            count: count.unwrap_or(0),
            unseen: unseen.unwrap_or(0),
        })
    }

    /// The counters of `mailbox_id`, all zero for a mailbox that never had a
    /// message.
    pub async fn read(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<MailboxCounters, Error> {
        self.read_raw(mailbox_id).await.map(RawCounters::clamped)
    }
}
