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

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use super::metadata::{update_versioned, MessageMetadataTable, Versioned};
use crate::model::*;
use crate::storage::codec::{decode, encode, key_of, KeyComponent};
use crate::storage::{ColumnStore, Row, RowKey, Table};
use crate::support::error::Error;

#[derive(Serialize, Deserialize)]
struct ByUidRow {
    message_id: MessageId,
    flags: Flags,
    modseq: Modseq,
}

impl Versioned for ByUidRow {
    fn modseq(&self) -> Modseq {
        self.modseq
    }
}

impl From<&MessageRecord> for ByUidRow {
    fn from(record: &MessageRecord) -> Self {
        Self {
            message_id: record.message_id,
            flags: record.flags.clone(),
            modseq: record.modseq,
        }
    }
}

/// Message placements keyed by (mailbox, UID).
///
/// This is the authoritative copy for flag updates.
#[derive(Clone)]
pub struct ByUidTable {
    store: Arc<dyn ColumnStore>,
}

fn key(mailbox_id: MailboxId, uid: Uid) -> RowKey {
    RowKey::new(mailbox_id.to_key(), uid.to_key())
}

fn from_row(row: Row) -> Result<MessageRecord, Error> {
    let value = decode::<ByUidRow>(Table::MessageByUid, &row.value)?;
    Ok(MessageRecord {
        mailbox_id: key_of(Table::MessageByUid, &row.key.partition)?,
        uid: key_of(Table::MessageByUid, &row.key.clustering)?,
        message_id: value.message_id,
        flags: value.flags,
        modseq: value.modseq,
    })
}

impl ByUidTable {
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        Self { store }
    }

    pub async fn retrieve(
        &self,
        mailbox_id: MailboxId,
        uid: Uid,
    ) -> Result<Option<MessageRecord>, Error> {
        let key = key(mailbox_id, uid);
        match self.store.read(Table::MessageByUid, &key).await? {
            None => Ok(None),
            Some(value) => from_row(Row { key, value }).map(Some),
        }
    }

    /// Stream the records of `mailbox_id` within `range`, in UID order.
    pub fn retrieve_range(
        &self,
        mailbox_id: MailboxId,
        range: MessageRange,
    ) -> BoxStream<'static, Result<MessageRecord, Error>> {
        self.retrieve_range_limited(mailbox_id, range, None)
    }

    pub fn retrieve_range_limited(
        &self,
        mailbox_id: MailboxId,
        range: MessageRange,
        limit: Option<usize>,
    ) -> BoxStream<'static, Result<MessageRecord, Error>> {
        let lower = range.lower().to_key();
        let upper = range.upper().map(|u| u.to_key());
        self.store
            .read_range(
                Table::MessageByUid,
                &mailbox_id.to_key(),
                Bound::Included(lower.as_slice()),
                upper.as_deref().map_or(Bound::Unbounded, Bound::Included),
                limit,
            )
            .map(|row| row.and_then(from_row))
            .boxed()
    }
}

#[async_trait]
impl MessageMetadataTable for ByUidTable {
    async fn insert(&self, record: &MessageRecord) -> Result<(), Error> {
        self.store
            .write(
                Table::MessageByUid,
                &key(record.mailbox_id, record.uid),
                encode(&ByUidRow::from(record))?,
            )
            .await
    }

    async fn delete(&self, id: &ComposedMessageId) -> Result<(), Error> {
        self.store
            .delete(Table::MessageByUid, &key(id.mailbox_id, id.uid))
            .await
    }

    async fn retrieve_record(
        &self,
        id: &ComposedMessageId,
    ) -> Result<Option<MessageRecord>, Error> {
        self.retrieve(id.mailbox_id, id.uid).await
    }

    async fn update_flags(
        &self,
        record: &MessageRecord,
        expected_old: Modseq,
    ) -> Result<bool, Error> {
        update_versioned(
            &*self.store,
            Table::MessageByUid,
            &key(record.mailbox_id, record.uid),
            expected_old,
            &ByUidRow::from(record),
        )
        .await
    }
}
