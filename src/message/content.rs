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
use crate::storage::codec::{decode, encode, KeyComponent};
use crate::storage::{ColumnStore, RowKey, Table};
use crate::support::error::Error;

/// Size, date, and blob of each message, keyed by message ID.
///
/// This is shared by every placement of the message.
#[derive(Clone)]
pub struct ContentTable {
    store: Arc<dyn ColumnStore>,
}

fn key(message_id: MessageId) -> RowKey {
    RowKey::single(message_id.to_key())
}

impl ContentTable {
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, content: &MessageContent) -> Result<(), Error> {
        self.store
            .write(
                Table::MessageContent,
                &key(content.message_id),
                encode(content)?,
            )
            .await
    }

    pub async fn retrieve(
        &self,
        message_id: MessageId,
    ) -> Result<Option<MessageContent>, Error> {
        self.store
            .read(Table::MessageContent, &key(message_id))
            .await?
            .map(|raw| decode(Table::MessageContent, &raw))
            .transpose()
    }

    pub async fn delete(&self, message_id: MessageId) -> Result<(), Error> {
        self.store
            .delete(Table::MessageContent, &key(message_id))
            .await
    }
}

#[cfg(test)]
mod test {
    use chrono::prelude::*;

    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::main(flavor = "current_thread")]
    async fn run_crud() {
        let table = ContentTable::new(Arc::new(MemoryStore::new()));
        let content = MessageContent {
            message_id: MessageId::random(),
            size: 42,
            internal_date: FixedOffset::east_opt(3600)
                .unwrap()
                .with_ymd_and_hms(2020, 5, 6, 7, 8, 9)
                .unwrap(),
            blob_id: BlobId("abc".to_owned()),
        };

        assert_eq!(None, table.retrieve(content.message_id).await.unwrap());
        table.save(&content).await.unwrap();
        assert_eq!(
            Some(&content),
            table.retrieve(content.message_id).await.unwrap().as_ref()
        );
        table.delete(content.message_id).await.unwrap();
        assert_eq!(None, table.retrieve(content.message_id).await.unwrap());
    }

    #[test]
    fn crud() {
        run_crud();
    }
}
