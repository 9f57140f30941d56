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

use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use chrono::prelude::*;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use super::codec::{decode, encode, key_of, KeyComponent};
use super::column::{ColumnStore, RowKey, Table};
use crate::support::error::Error;

/// A version of the logical layout of the tables.
///
/// Versions are recorded in the store once the data needed for them is in
/// place. Jobs which depend on some table being populated check the version
/// before starting.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion(pub u32);

impl SchemaVersion {
    /// Mailbox directory, message tables, and indexes.
    pub const BASE: Self = SchemaVersion(1);
    /// The path index is populated for every mailbox.
    pub const PATH_INDEX: Self = SchemaVersion(2);
    pub const LATEST: Self = Self::PATH_INDEX;
}

impl fmt::Debug for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize)]
struct SchemaVersionRow {
    applied_at: DateTime<Utc>,
}

/// Reads and records the schema version of a store.
#[derive(Clone)]
pub struct SchemaVersionStore {
    store: Arc<dyn ColumnStore>,
}

/// All versions live in one partition.
const PARTITION: &[u8] = b"";

impl SchemaVersionStore {
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        Self { store }
    }

    /// The highest recorded version, or `None` if nothing was ever recorded.
    pub async fn current(&self) -> Result<Option<SchemaVersion>, Error> {
        let mut current = None;
        let mut rows = self.store.read_range(
            Table::SchemaVersion,
            PARTITION,
            Bound::Unbounded,
            Bound::Unbounded,
            None,
        );
        while let Some(row) = rows.try_next().await? {
            let version =
                key_of::<u32>(Table::SchemaVersion, &row.key.clustering)?;
            current = current.max(Some(SchemaVersion(version)));
        }

        Ok(current)
    }

    pub async fn record(&self, version: SchemaVersion) -> Result<(), Error> {
        self.store
            .write(
                Table::SchemaVersion,
                &RowKey::new(PARTITION.to_vec(), version.0.to_key()),
                encode(&SchemaVersionRow {
                    applied_at: Utc::now(),
                })?,
            )
            .await
    }

    /// When `version` was recorded, if it was.
    pub async fn applied_at(
        &self,
        version: SchemaVersion,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let raw = self
            .store
            .read(
                Table::SchemaVersion,
                &RowKey::new(PARTITION.to_vec(), version.0.to_key()),
            )
            .await?;
        raw.map(|raw| {
            decode::<SchemaVersionRow>(Table::SchemaVersion, &raw)
                .map(|row| row.applied_at)
        })
        .transpose()
    }

    /// Fail with `SchemaVersionTooOld` unless the store is at least at
    /// `version`.
    pub async fn require(&self, version: SchemaVersion) -> Result<(), Error> {
        let current = self.current().await?;
        if current.map_or(true, |current| current < version) {
            return Err(Error::SchemaVersionTooOld {
                required: version.0,
                current: current.map(|v| v.0),
            });
        }

        Ok(())
    }
}
