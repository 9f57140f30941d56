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

use futures::stream::{BoxStream, StreamExt, TryStreamExt};

use super::mapper::MessageMapper;
use crate::model::*;
use crate::support::error::Error;

impl MessageMapper {
    pub async fn retrieve(
        &self,
        mailbox_id: MailboxId,
        uid: Uid,
    ) -> Result<Option<MessageRecord>, Error> {
        self.by_uid.retrieve(mailbox_id, uid).await
    }

    /// Stream the messages of `mailbox_id` in `range`, in UID order.
    pub fn find_in_mailbox(
        &self,
        mailbox_id: MailboxId,
        range: MessageRange,
        fetch_type: FetchType,
    ) -> BoxStream<'static, Result<FetchedMessage, Error>> {
        let records = self.by_uid.retrieve_range(mailbox_id, range);
        match fetch_type {
            FetchType::Metadata => records
                .map_ok(|record| FetchedMessage { record, full: None })
                .boxed(),
            FetchType::Full => {
                let this = self.clone();
                records
                    .and_then(move |record| {
                        let this = this.clone();
                        async move {
                            let full = this.fetch_full(&record).await?;
                            Ok(FetchedMessage {
                                record,
                                full: Some(full),
                            })
                        }
                    })
                    .boxed()
            },
        }
    }

    async fn fetch_full(
        &self,
        record: &MessageRecord,
    ) -> Result<FullContent, Error> {
        let content = self
            .content
            .retrieve(record.message_id)
            .await?
            .ok_or(Error::NxMessage)?;
        let body = self.blobs.read(&content.blob_id).await?;
        Ok(FullContent { content, body })
    }

    /// Every placement of `message_id`, according to the by-message-ID
    /// table.
    pub async fn find_by_message_id(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<MessageRecord>, Error> {
        self.by_message_id.retrieve_all(message_id).await
    }

    /// The message and unseen counts from the counters index.
    ///
    /// These are approximate. A mailbox without counters yet counts as
    /// empty.
    pub async fn mailbox_counters(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<MailboxCounters, Error> {
        self.index.mailbox_counters(mailbox_id).await
    }

    pub async fn count_messages(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<u64, Error> {
        Ok(self.mailbox_counters(mailbox_id).await?.count)
    }

    pub async fn count_unseen(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<u64, Error> {
        Ok(self.mailbox_counters(mailbox_id).await?.unseen)
    }

    pub async fn find_recent_uids(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Vec<Uid>, Error> {
        self.index.recent_uids(mailbox_id).await
    }

    pub async fn find_first_unseen_uid(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Option<Uid>, Error> {
        self.index.first_unseen(mailbox_id).await
    }

    pub async fn applicable_flags(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Flags, Error> {
        self.index.applicable_flags(mailbox_id).await
    }

    pub async fn last_uid(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Option<Uid>, Error> {
        self.uids.last_uid(mailbox_id).await
    }

    pub async fn highest_modseq(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Modseq, Error> {
        self.modseqs.highest_modseq(mailbox_id).await
    }
}

#[cfg(test)]
mod test {
    use super::super::test_support::*;
    use super::*;
    use crate::support::system_config::MapperConfig;

    #[tokio::main(flavor = "current_thread")]
    async fn run_fetch() {
        let f = Fixture::new(MapperConfig::default());
        let inbox = f.mailbox("INBOX").await;
        let m1 = f.add(inbox, &[Flag::Seen]).await;
        let m2 = f.add(inbox, &[]).await;

        let metadata: Vec<FetchedMessage> = f
            .mapper
            .find_in_mailbox(inbox, MessageRange::All, FetchType::Metadata)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            vec![m1.clone(), m2.clone()],
            metadata.iter().map(|m| m.record.clone()).collect::<Vec<_>>()
        );
        assert!(metadata.iter().all(|m| m.full.is_none()));

        let full: Vec<FetchedMessage> = f
            .mapper
            .find_in_mailbox(inbox, MessageRange::From(m2.uid), FetchType::Full)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(1, full.len());
        let content = full[0].full.as_ref().unwrap();
        assert_eq!(m2.message_id, content.content.message_id);
        assert_eq!(new_message(&[]).body, content.body);
        assert_eq!(content.body.len() as u64, content.content.size);
    }

    #[test]
    fn fetch() {
        run_fetch();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_empty_mailbox_defaults() {
        let f = Fixture::new(MapperConfig::default());
        let inbox = f.mailbox("INBOX").await;

        assert_eq!(
            MailboxCounters::default(),
            f.mapper.mailbox_counters(inbox).await.unwrap()
        );
        assert!(f.mapper.find_recent_uids(inbox).await.unwrap().is_empty());
        assert_eq!(None, f.mapper.find_first_unseen_uid(inbox).await.unwrap());
        assert!(f.mapper.applicable_flags(inbox).await.unwrap().is_empty());
        assert_eq!(None, f.mapper.last_uid(inbox).await.unwrap());
        assert_eq!(Modseq::ZERO, f.mapper.highest_modseq(inbox).await.unwrap());
        assert!(f
            .mapper
            .find_by_message_id(MessageId::random())
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn empty_mailbox_defaults() {
        run_empty_mailbox_defaults();
    }
}
