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

//! The two denormalised views of message placement.
//!
//! `ByUidTable` and `ByMessageIdTable` store the same `MessageRecord`, keyed
//! differently. Nothing keeps them in sync except the `MessageMapper` writing
//! both; each is usable on its own through `MessageMetadataTable`.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::model::*;
use crate::storage::codec::{decode, encode};
use crate::storage::{ColumnStore, RowKey, Table};
use crate::support::error::Error;

#[async_trait]
pub trait MessageMetadataTable: Send + Sync {
    /// Write `record`, replacing whatever was there.
    async fn insert(&self, record: &MessageRecord) -> Result<(), Error>;

    /// Delete the row for `id`. Deleting a missing row is not an error.
    async fn delete(&self, id: &ComposedMessageId) -> Result<(), Error>;

    async fn retrieve_record(
        &self,
        id: &ComposedMessageId,
    ) -> Result<Option<MessageRecord>, Error>;

    /// Replace the flags and modseq of the stored copy of `record` if its
    /// modseq is still `expected_old`.
    ///
    /// Returns `true` if the stored value is now `record`, `false` if the row
    /// had a different modseq or did not exist, in which case nothing was
    /// changed.
    async fn update_flags(
        &self,
        record: &MessageRecord,
        expected_old: Modseq,
    ) -> Result<bool, Error>;
}

/// A row value that carries a modseq.
pub(super) trait Versioned: Serialize + DeserializeOwned + Send + Sync {
    fn modseq(&self) -> Modseq;
}

/// Compare-and-set `new` into `key` if the row currently there has modseq
/// `expected_old`.
///
/// The CAS is on the exact bytes read, so a concurrent change of anything in
/// the row, not just the modseq, makes it fail.
pub(super) async fn update_versioned<R: Versioned>(
    store: &dyn ColumnStore,
    table: Table,
    key: &RowKey,
    expected_old: Modseq,
    new: &R,
) -> Result<bool, Error> {
    let Some(raw) = store.read(table, key).await? else {
        return Ok(false);
    };

    let current = decode::<R>(table, &raw)?;
    if current.modseq() != expected_old {
        return Ok(false);
    }

    store
        .compare_and_set(table, key, Some(&raw), Some(encode(new)?))
        .await
}
