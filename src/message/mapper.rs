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

use futures::TryStreamExt;
use log::{info, warn};

use super::by_message_id::ByMessageIdTable;
use super::by_uid::ByUidTable;
use super::content::ContentTable;
use super::index::IndexMaintainer;
use super::metadata::MessageMetadataTable;
use super::sequence::{ModseqProvider, UidProvider};
use crate::blob::BlobStore;
use crate::model::*;
use crate::storage::ColumnStore;
use crate::support::{
    error::Error, log_prefix::LogPrefix, system_config::MapperConfig,
};

/// How far `MessageMapper::remove` got.
enum Removal {
    Complete,
    /// Gone from the mailbox and the indexes, but still visible by message
    /// ID.
    Partial(Error),
}

impl Removal {
    fn complete(self) -> Result<(), Error> {
        match self {
            Removal::Complete => Ok(()),
            Removal::Partial(e) => Err(e),
        }
    }
}

/// Adds, moves, deletes, and updates the flags of messages.
///
/// Every compound operation here is a sequence of single-row writes, each of
/// which can fail on its own:
///
/// - A message is written to the by-message-ID table first and the by-UID
///   table second. If the second write fails, the message is visible by
///   message ID but not in its mailbox.
/// - Deletion goes the other way around, so a half-deleted message is
///   likewise only visible by message ID. The indexes forget the message as
///   soon as it is gone from the by-UID table.
/// - Otherwise the derived indexes are updated last and their failures are
///   only logged.
///
/// The mapper is cheap to clone.
#[derive(Clone)]
pub struct MessageMapper {
    pub(super) log_prefix: LogPrefix,
    pub(super) config: MapperConfig,
    pub(super) blobs: Arc<dyn BlobStore>,
    pub(super) uids: UidProvider,
    pub(super) modseqs: ModseqProvider,
    pub(super) by_uid: ByUidTable,
    pub(super) by_message_id: ByMessageIdTable,
    pub(super) content: ContentTable,
    pub(super) index: IndexMaintainer,
}

impl MessageMapper {
    pub fn new(
        log_prefix: LogPrefix,
        store: Arc<dyn ColumnStore>,
        blobs: Arc<dyn BlobStore>,
        config: MapperConfig,
    ) -> Self {
        Self {
            log_prefix,
            blobs,
            uids: UidProvider::new(Arc::clone(&store), &config),
            modseqs: ModseqProvider::new(Arc::clone(&store), &config),
            by_uid: ByUidTable::new(Arc::clone(&store)),
            by_message_id: ByMessageIdTable::new(Arc::clone(&store)),
            content: ContentTable::new(Arc::clone(&store)),
            index: IndexMaintainer::new(store),
            config,
        }
    }

    /// Add a new message to `mailbox_id`.
    ///
    /// The body is saved to the blob store and a new `MessageId` is assigned.
    pub async fn add(
        &self,
        mailbox_id: MailboxId,
        message: NewMessage,
    ) -> Result<MessageRecord, Error> {
        let size = message.body.len() as u64;
        let blob_id = self.blobs.save(message.body).await?;
        let content = MessageContent {
            message_id: MessageId::random(),
            size,
            internal_date: message.internal_date,
            blob_id,
        };
        self.content.save(&content).await?;

        match self
            .place(mailbox_id, content.message_id, message.flags)
            .await
        {
            Ok(record) => Ok(record),
            Err(e) => {
                if let Err(e2) = self.content.delete(content.message_id).await
                {
                    warn!(
                        "{} Orphaned content of {} after failed add: {e2}",
                        self.log_prefix, content.message_id
                    );
                }
                Err(e)
            },
        }
    }

    /// Place a copy of `source` in `destination` under a new UID and modseq.
    ///
    /// The copy shares the content of `source` and always carries `\Recent`.
    pub async fn copy(
        &self,
        destination: MailboxId,
        source: &MessageRecord,
    ) -> Result<MessageRecord, Error> {
        self.place(
            destination,
            source.message_id,
            source.flags.clone().with(Flag::Recent),
        )
        .await
    }

    /// Move `source` to `destination`.
    ///
    /// This is a copy followed by a delete of `source`. It is not atomic: if
    /// the delete fails, the message remains in both mailboxes, and the error
    /// is returned even though the copy exists.
    pub async fn move_to(
        &self,
        destination: MailboxId,
        source: &MessageRecord,
    ) -> Result<MessageRecord, Error> {
        let copy = self.copy(destination, source).await?;
        if let Err(e) = self.remove(source).await.and_then(Removal::complete)
        {
            warn!(
                "{} Moved {} from {}:{} to {}:{}, but the original \
                 remains: {e}",
                self.log_prefix,
                source.message_id,
                source.mailbox_id,
                source.uid,
                destination,
                copy.uid,
            );
            return Err(e);
        }

        Ok(copy)
    }

    /// Delete the message `uid` from `mailbox_id`.
    ///
    /// Returns the last state of the message, or `None` if it did not exist.
    pub async fn delete(
        &self,
        mailbox_id: MailboxId,
        uid: Uid,
    ) -> Result<Option<MessageRecord>, Error> {
        let Some(record) = self.by_uid.retrieve(mailbox_id, uid).await? else {
            return Ok(None);
        };

        self.remove(&record).await.and_then(Removal::complete)?;
        Ok(Some(record))
    }

    /// Delete every message of `mailbox_id` in `range`.
    ///
    /// A message which cannot be deleted is logged and skipped. Returns the
    /// messages which are no longer in the mailbox.
    pub async fn delete_messages(
        &self,
        mailbox_id: MailboxId,
        range: MessageRange,
    ) -> Result<Vec<MessageRecord>, Error> {
        let records: Vec<MessageRecord> = self
            .by_uid
            .retrieve_range(mailbox_id, range)
            .try_collect()
            .await?;

        let mut deleted = Vec::with_capacity(records.len());
        for record in records {
            if self.remove_from_batch(&record).await {
                deleted.push(record);
            }
        }

        Ok(deleted)
    }

    /// Delete every message of `mailbox_id` in `range` which carries
    /// `\Deleted`.
    ///
    /// Candidates come from the deleted-message index, a batch at a time.
    /// Each candidate is re-read before it is deleted, so a stale index
    /// entry never causes an unflagged message to be expunged, but a message
    /// missing from the index is not expunged either.
    ///
    /// A message which cannot be expunged is logged and skipped, and the
    /// remaining candidates are still processed.
    pub async fn expunge_marked_for_deletion(
        &self,
        mailbox_id: MailboxId,
        range: MessageRange,
    ) -> Result<Vec<MessageRecord>, Error> {
        let batch_size = self.config.expunge_batch_size.max(1);
        let mut expunged = Vec::new();
        let mut remaining = Some(range);

        while let Some(range) = remaining {
            let batch = self
                .index
                .deleted_uids(mailbox_id, range, batch_size)
                .await?;
            let Some(&last) = batch.last() else {
                break;
            };

            for uid in batch {
                let record = match self.by_uid.retrieve(mailbox_id, uid).await
                {
                    Ok(Some(record)) => record,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(
                            "{} Skipping expunge of {} in {}: {e}",
                            self.log_prefix, uid, mailbox_id
                        );
                        continue;
                    },
                };

                if record.flags.is_deleted()
                    && self.remove_from_batch(&record).await
                {
                    expunged.push(record);
                }
            }

            remaining = last.next().and_then(|next| range.starting_at(next));
        }

        if !expunged.is_empty() {
            info!(
                "{} Expunged {} messages from {}",
                self.log_prefix,
                expunged.len(),
                mailbox_id
            );
        }

        Ok(expunged)
    }

    async fn place(
        &self,
        mailbox_id: MailboxId,
        message_id: MessageId,
        flags: Flags,
    ) -> Result<MessageRecord, Error> {
        let uid = self.uids.next_uid(mailbox_id).await?;
        let modseq = self.modseqs.next_modseq(mailbox_id).await?;
        let record = MessageRecord {
            mailbox_id,
            message_id,
            uid,
            flags,
            modseq,
        };

        self.by_message_id.insert(&record).await?;
        if let Err(e) = self.by_uid.insert(&record).await {
            warn!(
                "{} {} added to {} as {} is only visible by message ID: {e}",
                self.log_prefix, message_id, mailbox_id, uid
            );
            return Err(e);
        }

        self.index_updated(self.index.on_add(&record).await, "add", &record);
        Ok(record)
    }

    /// Remove the placement `record` from both tables and the indexes, then
    /// drop the content if this was the last placement.
    ///
    /// Fails only if the message is still in its mailbox. Once the by-UID row
    /// is gone the indexes are updated regardless of what happens next.
    async fn remove(&self, record: &MessageRecord) -> Result<Removal, Error> {
        let id = record.composed_id();
        self.by_uid.delete(&id).await?;

        let indexed = self.index.on_delete(record).await;
        self.index_updated(indexed, "delete", record);

        if let Err(e) = self.by_message_id.delete(&id).await {
            warn!(
                "{} {} deleted from {} as {} is still visible by message ID: \
                 {e}",
                self.log_prefix, id.message_id, id.mailbox_id, id.uid
            );
            return Ok(Removal::Partial(e));
        }

        match self.by_message_id.retrieve_all(record.message_id).await {
            Ok(placements) if placements.is_empty() => {
                if let Err(e) = self.content.delete(record.message_id).await {
                    warn!(
                        "{} Failed to drop content of {}: {e}",
                        self.log_prefix, record.message_id
                    );
                }
            },
            Ok(_) => {},
            Err(e) => warn!(
                "{} Failed to check remaining placements of {}: {e}",
                self.log_prefix, record.message_id
            ),
        }

        Ok(Removal::Complete)
    }

    /// `remove` for batch operations, which carry on past failures.
    ///
    /// Returns whether the message is gone from its mailbox.
    async fn remove_from_batch(&self, record: &MessageRecord) -> bool {
        match self.remove(record).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "{} Failed to delete {} from {}: {e}",
                    self.log_prefix, record.uid, record.mailbox_id
                );
                false
            },
        }
    }

    /// Log a failed index update. Index failures never fail the operation
    /// that triggered them.
    pub(super) fn index_updated(
        &self,
        result: Result<(), Error>,
        what: &str,
        record: &MessageRecord,
    ) {
        if let Err(e) = result {
            warn!(
                "{} Indexes of {} not updated after {what} of {}: {e}",
                self.log_prefix, record.mailbox_id, record.uid
            );
        }
    }
}
