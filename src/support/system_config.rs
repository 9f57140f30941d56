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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::Error;

/// The configuration for the column-store metadata layer.
///
/// This is stored in a file named `cstore.toml` under the root passed to the
/// administrative tool. Every section is optional.
#[derive(Clone, Debug, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StoreConfig {
    /// Where the rows live.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Tuning for the message mapper.
    #[serde(default)]
    pub mapper: MapperConfig,
}

impl StoreConfig {
    pub fn parse(toml_text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(toml_text)?)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// The path to the SQLite database backing the store, relative to the
    /// root.
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("cstore.sqlite"),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MapperConfig {
    /// How many times a flag update re-reads and retries the messages whose
    /// compare-and-set lost against a concurrent writer.
    ///
    /// Messages still contended after this many retries are left out of the
    /// result.
    pub max_flag_update_retries: u32,
    /// The maximum number of compare-and-set attempts made to allocate a
    /// single UID or modseq before giving up.
    pub max_sequence_retries: u32,
    /// The number of messages expunged per batch.
    pub expunge_batch_size: usize,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            max_flag_update_retries: 5,
            max_sequence_retries: 1000,
            expunge_batch_size: 100,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_empty() {
        assert_eq!(StoreConfig::default(), StoreConfig::parse("").unwrap());
    }

    #[test]
    fn parse_partial() {
        let config = StoreConfig::parse(
            "[mapper]\n\
             max_flag_update_retries = 2\n",
        )
        .unwrap();
        assert_eq!(2, config.mapper.max_flag_update_retries);
        assert_eq!(1000, config.mapper.max_sequence_retries);
        assert_eq!(100, config.mapper.expunge_batch_size);
        assert_eq!(
            PathBuf::from("cstore.sqlite"),
            config.storage.sqlite_path,
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_matches!(
            Err(Error::Toml(..)),
            StoreConfig::parse("[mapper]\nexpunge_batch_size = \"many\"\n")
        );
    }
}
