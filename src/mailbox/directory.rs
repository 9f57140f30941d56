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

use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::model::*;
use crate::storage::codec::{decode, encode, key_of, KeyComponent};
use crate::storage::{ColumnStore, Row, RowKey, Table};
use crate::support::error::Error;

/// The value of a row in the mailbox directory.
#[derive(Serialize, Deserialize)]
struct MailboxRow {
    path: MailboxPath,
    uid_validity: UidValidity,
    #[serde(default)]
    acl: MailboxAcl,
}

/// The authoritative mailbox table, keyed by mailbox ID.
#[derive(Clone)]
pub struct MailboxDirectory {
    store: Arc<dyn ColumnStore>,
}

fn key(id: MailboxId) -> RowKey {
    RowKey::single(id.to_key())
}

fn from_row(row: Row) -> Result<Mailbox, Error> {
    let id = key_of::<MailboxId>(Table::Mailbox, &row.key.partition)?;
    let value = decode::<MailboxRow>(Table::Mailbox, &row.value)?;
    Ok(Mailbox {
        id,
        path: value.path,
        uid_validity: value.uid_validity,
        acl: value.acl,
    })
}

impl MailboxDirectory {
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        Self { store }
    }

    /// Write the row for `mailbox`, replacing any existing one.
    pub async fn save(&self, mailbox: &Mailbox) -> Result<(), Error> {
        let value = encode(&MailboxRow {
            path: mailbox.path.clone(),
            uid_validity: mailbox.uid_validity,
            acl: mailbox.acl.clone(),
        })?;
        self.store.write(Table::Mailbox, &key(mailbox.id), value).await
    }

    pub async fn retrieve(
        &self,
        id: MailboxId,
    ) -> Result<Option<Mailbox>, Error> {
        let key = key(id);
        match self.store.read(Table::Mailbox, &key).await? {
            None => Ok(None),
            Some(value) => from_row(Row { key, value }).map(Some),
        }
    }

    pub async fn delete(&self, id: MailboxId) -> Result<(), Error> {
        self.store.delete(Table::Mailbox, &key(id)).await
    }

    /// Stream every mailbox in the directory, in no particular order.
    pub fn list(&self) -> BoxStream<'static, Result<Mailbox, Error>> {
        self.store
            .scan(Table::Mailbox)
            .map(|row| row.and_then(from_row))
            .boxed()
    }
}
