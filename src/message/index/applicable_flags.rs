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

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::model::*;
use crate::storage::codec::{decode, encode, KeyComponent};
use crate::storage::{ColumnStore, RowKey, Table};
use crate::support::error::Error;

/// Every flag ever set on a message of a mailbox.
///
/// The set only grows. `\Recent` is never included since it is not a flag
/// clients can set.
#[derive(Clone)]
pub struct ApplicableFlagsIndex {
    store: Arc<dyn ColumnStore>,
}

impl ApplicableFlagsIndex {
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        Self { store }
    }

    pub async fn add_all(
        &self,
        mailbox_id: MailboxId,
        flags: &Flags,
    ) -> Result<(), Error> {
        let partition = mailbox_id.to_key();
        stream::iter(flags.iter().filter(|&f| Flag::Recent != *f))
            .map(|flag| {
                // Keywords are case-insensitive, so the lowercase form is the
                // key; the first spelling seen is kept as the value.
                let key = RowKey::new(
                    partition.clone(),
                    flag.to_string().to_lowercase().into_bytes(),
                );
                async move {
                    let value = encode(flag)?;
                    self.store
                        .compare_and_set(
                            Table::ApplicableFlags,
                            &key,
                            None,
                            Some(value),
                        )
                        .await
                        .map(|_| ())
                }
            })
            .buffer_unordered(8)
            .try_collect::<()>()
            .await
    }

    pub async fn read(&self, mailbox_id: MailboxId) -> Result<Flags, Error> {
        self.store
            .read_range(
                Table::ApplicableFlags,
                &mailbox_id.to_key(),
                Bound::Unbounded,
                Bound::Unbounded,
                None,
            )
            .map(|row| {
                row.and_then(|row| {
                    decode::<Flag>(Table::ApplicableFlags, &row.value)
                })
            })
            .try_collect()
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::main(flavor = "current_thread")]
    async fn run_accretion() {
        let index = ApplicableFlagsIndex::new(Arc::new(MemoryStore::new()));
        let mailbox = MailboxId::random();
        assert!(index.read(mailbox).await.unwrap().is_empty());

        index
            .add_all(
                mailbox,
                &[Flag::Seen, Flag::Recent, Flag::Keyword("Work".to_owned())]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();
        index
            .add_all(
                mailbox,
                &[Flag::Flagged, Flag::Keyword("WORK".to_owned())]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();

        let flags = index.read(mailbox).await.unwrap();
        assert_eq!(3, flags.len());
        assert!(flags.contains(&Flag::Seen));
        assert!(flags.contains(&Flag::Flagged));
        assert!(!flags.is_recent());
        assert_eq!(
            Some("Work".to_owned()),
            flags
                .iter()
                .find(|f| matches!(f, Flag::Keyword(_)))
                .map(|f| f.to_string())
        );
    }

    #[test]
    fn accretion() {
        run_accretion();
    }
}
