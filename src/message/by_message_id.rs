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
use futures::stream::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use super::metadata::{update_versioned, MessageMetadataTable, Versioned};
use crate::model::*;
use crate::storage::codec::{decode, encode, key_of, KeyComponent};
use crate::storage::{ColumnStore, Row, RowKey, Table};
use crate::support::error::Error;

/// How many times `propagate_flags` re-reads a row changed underneath it.
const PROPAGATE_ATTEMPTS: u32 = 3;

#[derive(Serialize, Deserialize)]
struct ByMessageIdRow {
    flags: Flags,
    modseq: Modseq,
}

impl Versioned for ByMessageIdRow {
    fn modseq(&self) -> Modseq {
        self.modseq
    }
}

impl From<&MessageRecord> for ByMessageIdRow {
    fn from(record: &MessageRecord) -> Self {
        Self {
            flags: record.flags.clone(),
            modseq: record.modseq,
        }
    }
}

/// Message placements keyed by message ID, then (mailbox, UID).
///
/// The same message can be placed in one mailbox more than once, so the
/// mailbox alone does not identify a placement.
#[derive(Clone)]
pub struct ByMessageIdTable {
    store: Arc<dyn ColumnStore>,
}

fn key(id: &ComposedMessageId) -> RowKey {
    let mut clustering = id.mailbox_id.to_key();
    clustering.extend_from_slice(&id.uid.to_key());
    RowKey::new(id.message_id.to_key(), clustering)
}

fn from_row(row: Row) -> Result<MessageRecord, Error> {
    let value = decode::<ByMessageIdRow>(Table::MessageById, &row.value)?;
    let clustering = &row.key.clustering;
    // The mailbox ID is a fixed-width UUID
    let split = clustering.len().saturating_sub(4);
    Ok(MessageRecord {
        message_id: key_of(Table::MessageById, &row.key.partition)?,
        mailbox_id: key_of(Table::MessageById, &clustering[..split])?,
        uid: key_of(Table::MessageById, &clustering[split..])?,
        flags: value.flags,
        modseq: value.modseq,
    })
}

impl ByMessageIdTable {
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        Self { store }
    }

    /// Copy the flags and modseq of the authoritative `record` into its row.
    ///
    /// Unlike `update_flags`, this does not require the row to be at any
    /// particular modseq, so a copy which missed an earlier update catches
    /// up. It still never creates a row, and never replaces a copy carrying
    /// a later modseq than `record`.
    ///
    /// Returns whether the row now holds `record`.
    pub async fn propagate_flags(
        &self,
        record: &MessageRecord,
    ) -> Result<bool, Error> {
        let key = key(&record.composed_id());
        let new = encode(&ByMessageIdRow::from(record))?;

        for _ in 0..PROPAGATE_ATTEMPTS {
            let Some(raw) = self.store.read(Table::MessageById, &key).await?
            else {
                return Ok(false);
            };

            let current = decode::<ByMessageIdRow>(Table::MessageById, &raw)?;
            if current.modseq > record.modseq {
                return Ok(false);
            }

            if self
                .store
                .compare_and_set(
                    Table::MessageById,
                    &key,
                    Some(&raw),
                    Some(new.clone()),
                )
                .await?
            {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Every placement of `message_id`, ordered by mailbox ID then UID.
    pub async fn retrieve_all(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<MessageRecord>, Error> {
        self.store
            .read_range(
                Table::MessageById,
                &message_id.to_key(),
                Bound::Unbounded,
                Bound::Unbounded,
                None,
            )
            .map(|row| row.and_then(from_row))
            .try_collect()
            .await
    }
}

#[async_trait]
impl MessageMetadataTable for ByMessageIdTable {
    async fn insert(&self, record: &MessageRecord) -> Result<(), Error> {
        self.store
            .write(
                Table::MessageById,
                &key(&record.composed_id()),
                encode(&ByMessageIdRow::from(record))?,
            )
            .await
    }

    async fn delete(&self, id: &ComposedMessageId) -> Result<(), Error> {
        self.store
            .delete(Table::MessageById, &key(id))
            .await
    }

    async fn retrieve_record(
        &self,
        id: &ComposedMessageId,
    ) -> Result<Option<MessageRecord>, Error> {
        let key = key(id);
        match self.store.read(Table::MessageById, &key).await? {
            None => Ok(None),
            Some(value) => from_row(Row { key, value }).map(Some),
        }
    }

    async fn update_flags(
        &self,
        record: &MessageRecord,
        expected_old: Modseq,
    ) -> Result<bool, Error> {
        update_versioned(
            &*self.store,
            Table::MessageById,
            &key(&record.composed_id()),
            expected_old,
            &ByMessageIdRow::from(record),
        )
        .await
    }
}
