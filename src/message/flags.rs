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

//! The optimistic flag update protocol.
//!
//! A flag update is a series of rounds. Each round takes the current records
//! of the messages still to be updated, allocates at most one modseq shared
//! by every message it changes, and compare-and-sets each by-UID row against
//! the modseq it was read with. Messages whose row changed underneath are
//! re-read and retried in the next round, up to
//! `MapperConfig::max_flag_update_retries` times.

use futures::stream::{self, StreamExt, TryStreamExt};
use log::{debug, warn};

use super::mapper::MessageMapper;
use super::metadata::MessageMetadataTable;
use crate::model::*;
use crate::support::error::Error;

/// How many compare-and-set requests a round keeps in flight.
const CONCURRENT_UPDATES: usize = 16;

/// The outcome of one or more rounds of a flag update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlagsUpdateStageResult {
    pub succeeded: Vec<UpdatedFlags>,
    /// UIDs whose compare-and-set lost to a concurrent writer.
    pub failed: Vec<Uid>,
}

impl FlagsUpdateStageResult {
    pub fn success(updated: UpdatedFlags) -> Self {
        Self {
            succeeded: vec![updated],
            failed: Vec::new(),
        }
    }

    pub fn fail(uid: Uid) -> Self {
        Self {
            succeeded: Vec::new(),
            failed: vec![uid],
        }
    }

    /// Combine two results. This is associative, with `default()` as the
    /// identity.
    pub fn merge(mut self, other: Self) -> Self {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self
    }

    /// Forget the failures, e.g. because they are about to be retried.
    pub fn keep_succeeded(self) -> Self {
        Self {
            succeeded: self.succeeded,
            failed: Vec::new(),
        }
    }

    pub fn contains_failed(&self) -> bool {
        !self.failed.is_empty()
    }
}

impl MessageMapper {
    /// Update the flags of the messages of `mailbox_id` in `range`.
    ///
    /// Returns one `UpdatedFlags` per message whose update went through,
    /// ordered by UID. Messages whose flags would not change are included
    /// with their modseq unchanged, and nothing is written for them.
    ///
    /// Messages still contended after the last retry are logged and left out
    /// of the result; callers needing to know about every message must
    /// compare the result against what they asked for.
    pub async fn update_flags(
        &self,
        mailbox_id: MailboxId,
        calculator: FlagsUpdateCalculator,
        range: MessageRange,
    ) -> Result<Vec<UpdatedFlags>, Error> {
        let mut candidates: Vec<MessageRecord> = self
            .by_uid
            .retrieve_range(mailbox_id, range)
            .try_collect()
            .await?;
        let mut result = FlagsUpdateStageResult::default();
        let mut retries = 0;

        loop {
            let stage = self
                .update_flags_stage(mailbox_id, &calculator, candidates)
                .await?;
            result = result.keep_succeeded().merge(stage);

            if !result.contains_failed() {
                break;
            }

            if retries >= self.config.max_flag_update_retries {
                warn!(
                    "{} Gave up updating flags of {:?} in {} after {} \
                     retries",
                    self.log_prefix, result.failed, mailbox_id, retries
                );
                break;
            }

            retries += 1;
            debug!(
                "{} Retrying flag update of {} contended messages in {} \
                 (retry {})",
                self.log_prefix,
                result.failed.len(),
                mailbox_id,
                retries
            );
            candidates = self.reread(mailbox_id, &result.failed).await?;
        }

        let mut updated = result.succeeded;
        updated.sort_by_key(|u| u.uid);
        Ok(updated)
    }

    /// Run one round of the protocol over `candidates`.
    async fn update_flags_stage(
        &self,
        mailbox_id: MailboxId,
        calculator: &FlagsUpdateCalculator,
        candidates: Vec<MessageRecord>,
    ) -> Result<FlagsUpdateStageResult, Error> {
        let mut result = FlagsUpdateStageResult::default();
        let mut changing = Vec::with_capacity(candidates.len());

        for record in candidates {
            let new_flags = calculator.apply(&record.flags);
            if new_flags == record.flags {
                result = result.merge(FlagsUpdateStageResult::success(
                    UpdatedFlags {
                        uid: record.uid,
                        message_id: record.message_id,
                        modseq: record.modseq,
                        old_flags: record.flags.clone(),
                        new_flags,
                    },
                ));
            } else {
                changing.push((record, new_flags));
            }
        }

        if changing.is_empty() {
            return Ok(result);
        }

        let modseq = self.modseqs.next_modseq(mailbox_id).await?;
        stream::iter(changing)
            .map(|(record, new_flags)| {
                self.try_update_flags(record, new_flags, modseq)
            })
            .buffer_unordered(CONCURRENT_UPDATES)
            .try_fold(result, |result, stage| async move {
                Ok(result.merge(stage))
            })
            .await
    }

    /// Try to move one message to `new_flags` at `modseq`.
    async fn try_update_flags(
        &self,
        record: MessageRecord,
        new_flags: Flags,
        modseq: Modseq,
    ) -> Result<FlagsUpdateStageResult, Error> {
        let updated_record = record.with_flags(new_flags, modseq);

        match self
            .by_uid
            .update_flags(&updated_record, record.modseq)
            .await
        {
            Ok(true) => {},
            Ok(false) => return Ok(FlagsUpdateStageResult::fail(record.uid)),
            Err(e) if e.is_transient() => {
                debug!(
                    "{} Flag update of {} in {} failed: {e}",
                    self.log_prefix, record.uid, record.mailbox_id
                );
                return Ok(FlagsUpdateStageResult::fail(record.uid));
            },
            Err(e) => return Err(e),
        }

        // The by-UID row is authoritative. The by-message-ID copy follows it
        // on a best-effort basis.
        match self.by_message_id.propagate_flags(&updated_record).await {
            Ok(true) => {},
            Ok(false) => debug!(
                "{} By-message-ID row of {} in {} gone or newer; flags not \
                 propagated",
                self.log_prefix, record.uid, record.mailbox_id
            ),
            Err(e) => warn!(
                "{} Failed to propagate flags of {} in {} by message ID: {e}",
                self.log_prefix, record.uid, record.mailbox_id
            ),
        }

        let updated = UpdatedFlags {
            uid: record.uid,
            message_id: record.message_id,
            modseq,
            old_flags: record.flags,
            new_flags: updated_record.flags.clone(),
        };
        self.index_updated(
            self.index
                .on_flags_update(record.mailbox_id, &updated)
                .await,
            "flag update",
            &updated_record,
        );

        Ok(FlagsUpdateStageResult::success(updated))
    }

    /// Read the current records of `uids`. Messages which no longer exist
    /// are dropped.
    async fn reread(
        &self,
        mailbox_id: MailboxId,
        uids: &[Uid],
    ) -> Result<Vec<MessageRecord>, Error> {
        let mut records = Vec::with_capacity(uids.len());
        for &uid in uids {
            match self.by_uid.retrieve(mailbox_id, uid).await? {
                Some(record) => records.push(record),
                None => debug!(
                    "{} {} in {} expunged during flag update",
                    self.log_prefix, uid, mailbox_id
                ),
            }
        }

        Ok(records)
    }
}
