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

use std::ops::Bound;
use std::sync::Arc;

use futures::stream::{StreamExt, TryStreamExt};

use crate::model::*;
use crate::storage::codec::{key_of, KeyComponent};
use crate::storage::{ColumnStore, RowKey, Table};
use crate::support::error::Error;

/// A set of UIDs per mailbox, one row per member.
///
/// Used for the recent, unseen, and deleted indexes. Since rows are ordered
/// by UID, the smallest member is a single-row read.
#[derive(Clone)]
pub struct UidSetIndex {
    store: Arc<dyn ColumnStore>,
    table: Table,
}

impl UidSetIndex {
    pub fn new(store: Arc<dyn ColumnStore>, table: Table) -> Self {
        Self { store, table }
    }

    fn key(mailbox_id: MailboxId, uid: Uid) -> RowKey {
        RowKey::new(mailbox_id.to_key(), uid.to_key())
    }

    pub async fn add(
        &self,
        mailbox_id: MailboxId,
        uid: Uid,
    ) -> Result<(), Error> {
        self.store
            .write(self.table, &Self::key(mailbox_id, uid), Vec::new())
            .await
    }

    pub async fn remove(
        &self,
        mailbox_id: MailboxId,
        uid: Uid,
    ) -> Result<(), Error> {
        self.store
            .delete(self.table, &Self::key(mailbox_id, uid))
            .await
    }

    /// Members of the set within `range`, in ascending order, at most
    /// `limit` of them.
    pub async fn list(
        &self,
        mailbox_id: MailboxId,
        range: MessageRange,
        limit: Option<usize>,
    ) -> Result<Vec<Uid>, Error> {
        let lower = range.lower().to_key();
        let upper = range.upper().map(|u| u.to_key());
        let table = self.table;
        self.store
            .read_range(
                table,
                &mailbox_id.to_key(),
                Bound::Included(lower.as_slice()),
                upper.as_deref().map_or(Bound::Unbounded, Bound::Included),
                limit,
            )
            .map(move |row| {
                row.and_then(|row| key_of::<Uid>(table, &row.key.clustering))
            })
            .try_collect()
            .await
    }

    /// The smallest member of the set.
    pub async fn first(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Option<Uid>, Error> {
        Ok(self
            .list(mailbox_id, MessageRange::All, Some(1))
            .await?
            .into_iter()
            .next())
    }
}
