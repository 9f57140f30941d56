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

use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::model::*;
use crate::storage::codec::{decode, encode, key_of, KeyComponent};
use crate::storage::{ColumnStore, Row, RowKey, Table};
use crate::support::error::Error;

/// The value of a row in the path index.
#[derive(Serialize, Deserialize)]
struct PathRow {
    mailbox_id: MailboxId,
}

/// The mailbox table keyed by path.
///
/// Rows are partitioned by (namespace, user) so that listing the mailboxes of
/// one user is a single range read; the clustering key is the mailbox name.
/// This table is written independently of the `MailboxDirectory` and may
/// disagree with it after a partial failure.
#[derive(Clone)]
pub struct PathIndex {
    store: Arc<dyn ColumnStore>,
}

fn partition(namespace: &str, user: Option<&str>) -> Result<Vec<u8>, Error> {
    encode(&(namespace, user))
}

fn key(path: &MailboxPath) -> Result<RowKey, Error> {
    Ok(RowKey::new(
        partition(&path.namespace, path.user.as_deref())?,
        path.name.clone().to_key(),
    ))
}

fn value(id: MailboxId) -> Result<Vec<u8>, Error> {
    encode(&PathRow { mailbox_id: id })
}

fn from_row(row: Row) -> Result<(MailboxPath, MailboxId), Error> {
    let (namespace, user) =
        decode::<(String, Option<String>)>(
            Table::MailboxPath,
            &row.key.partition,
        )?;
    let name = key_of::<String>(Table::MailboxPath, &row.key.clustering)?;
    let value = decode::<PathRow>(Table::MailboxPath, &row.value)?;
    Ok((
        MailboxPath {
            namespace,
            user,
            name,
        },
        value.mailbox_id,
    ))
}

impl PathIndex {
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        Self { store }
    }

    /// Unconditionally point `path` at `id`.
    pub async fn save(
        &self,
        path: &MailboxPath,
        id: MailboxId,
    ) -> Result<(), Error> {
        self.store
            .write(Table::MailboxPath, &key(path)?, value(id)?)
            .await
    }

    /// Point `path` at `id` if `path` is not yet in the index.
    ///
    /// Returns whether the row was written.
    pub async fn try_save(
        &self,
        path: &MailboxPath,
        id: MailboxId,
    ) -> Result<bool, Error> {
        self.store
            .compare_and_set(
                Table::MailboxPath,
                &key(path)?,
                None,
                Some(value(id)?),
            )
            .await
    }

    pub async fn retrieve(
        &self,
        path: &MailboxPath,
    ) -> Result<Option<MailboxId>, Error> {
        match self.store.read(Table::MailboxPath, &key(path)?).await? {
            None => Ok(None),
            Some(raw) => Ok(Some(
                decode::<PathRow>(Table::MailboxPath, &raw)?.mailbox_id,
            )),
        }
    }

    pub async fn delete(&self, path: &MailboxPath) -> Result<(), Error> {
        self.store.delete(Table::MailboxPath, &key(path)?).await
    }

    /// Delete the row for `path` only if it still points at `id`.
    ///
    /// Returns whether the row was deleted.
    pub async fn delete_if_points_to(
        &self,
        path: &MailboxPath,
        id: MailboxId,
    ) -> Result<bool, Error> {
        self.store
            .compare_and_set(
                Table::MailboxPath,
                &key(path)?,
                Some(&value(id)?),
                None,
            )
            .await
    }

    /// Stream every entry of the index, in no particular order.
    pub fn list(
        &self,
    ) -> BoxStream<'static, Result<(MailboxPath, MailboxId), Error>> {
        self.store
            .scan(Table::MailboxPath)
            .map(|row| row.and_then(from_row))
            .boxed()
    }

    /// Stream the entries of one user in one namespace, ordered by name.
    pub fn list_for_user(
        &self,
        namespace: &str,
        user: Option<&str>,
    ) -> BoxStream<'static, Result<(MailboxPath, MailboxId), Error>> {
        let partition = match partition(namespace, user) {
            Ok(p) => p,
            Err(e) => {
                return futures::stream::once(async move { Err(e) }).boxed()
            },
        };

        self.store
            .read_range(
                Table::MailboxPath,
                &partition,
                Bound::Unbounded,
                Bound::Unbounded,
                None,
            )
            .map(|row| row.and_then(from_row))
            .boxed()
    }
}

#[cfg(test)]
mod test {
    use futures::TryStreamExt;

    use super::*;
    use crate::storage::MemoryStore;

    fn path(user: &str, name: &str) -> MailboxPath {
        MailboxPath::for_user(user, name).unwrap()
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_claims() {
        let index = PathIndex::new(Arc::new(MemoryStore::new()));
        let inbox = path("alice", "INBOX");
        let a = MailboxId::random();
        let b = MailboxId::random();

        assert!(index.try_save(&inbox, a).await.unwrap());
        assert!(!index.try_save(&inbox, b).await.unwrap());
        assert_eq!(Some(a), index.retrieve(&inbox).await.unwrap());

        assert!(!index.delete_if_points_to(&inbox, b).await.unwrap());
        assert_eq!(Some(a), index.retrieve(&inbox).await.unwrap());
        assert!(index.delete_if_points_to(&inbox, a).await.unwrap());
        assert_eq!(None, index.retrieve(&inbox).await.unwrap());

        index.save(&inbox, b).await.unwrap();
        index.save(&inbox, a).await.unwrap();
        assert_eq!(Some(a), index.retrieve(&inbox).await.unwrap());
        index.delete(&inbox).await.unwrap();
        assert_eq!(None, index.retrieve(&inbox).await.unwrap());
    }

    #[test]
    fn claims() {
        run_claims();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_listing() {
        let index = PathIndex::new(Arc::new(MemoryStore::new()));
        let shared =
            MailboxPath::new("#shared", None, "Announcements").unwrap();
        for p in [
            path("alice", "Sent"),
            path("alice", "INBOX"),
            path("bob", "INBOX"),
            shared.clone(),
        ] {
            index.save(&p, MailboxId::random()).await.unwrap();
        }

        let all: Vec<(MailboxPath, MailboxId)> =
            index.list().try_collect().await.unwrap();
        assert_eq!(4, all.len());
        assert!(all.iter().any(|(p, _)| *p == shared));

        let alice: Vec<(MailboxPath, MailboxId)> = index
            .list_for_user(PRIVATE_NAMESPACE, Some("alice"))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            vec![path("alice", "INBOX"), path("alice", "Sent")],
            alice.into_iter().map(|(p, _)| p).collect::<Vec<_>>()
        );
    }

    #[test]
    fn listing() {
        run_listing();
    }
}
