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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Mailbox not found")]
    NxMailbox,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("Message not found")]
    NxMessage,
    #[error("Blob not found")]
    NxBlob,
    #[error("Unsafe flag or mailbox name")]
    UnsafeName,
    #[error("Unknown system flag")]
    NxFlag,
    #[error("UID space exhausted")]
    UidExhausted,
    #[error("Modseq space exhausted")]
    ModseqExhausted,
    #[error("Gave up on {what} after {attempts} contended attempts")]
    Contended { what: &'static str, attempts: u32 },
    #[error("Store temporarily unavailable: {0}")]
    Transient(String),
    #[error(
        "Schema version {required} required, but the store is at {current:?}"
    )]
    SchemaVersionTooOld { required: u32, current: Option<u32> },
    #[error("Corrupt row in table {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Whether this error is expected to go away if the same operation is
    /// simply attempted again.
    ///
    /// The CAS retry loops absorb these errors until their budget runs out.
    pub fn is_transient(&self) -> bool {
        match *self {
            Error::Transient(_) => true,
            Error::Sqlite(rusqlite::Error::SqliteFailure(ref e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Transient("timeout".to_owned()).is_transient());
        assert!(Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
        .is_transient());
        assert!(!Error::NxMailbox.is_transient());
        assert!(!Error::Contended {
            what: "UID allocation",
            attempts: 3,
        }
        .is_transient());
    }
}
