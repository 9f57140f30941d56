//-
// Copyright (c) 2023, 2024, Jason Lingle
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

//! Bindings for our model types to the key and value encodings of the column
//! store.
//!
//! Keys must sort byte-wise in the same order as the values they encode, so
//! integers are big-endian. Values are CBOR.

use std::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::column::Table;
use crate::{model::*, support::error::Error};

/// A type which can be used as (part of) a row key.
pub trait KeyComponent: Sized {
    fn to_key(&self) -> Vec<u8>;
    fn from_key(key: &[u8]) -> Option<Self>;
}

macro_rules! uuid_key_component {
    ($t:ident) => {
        impl KeyComponent for $t {
            fn to_key(&self) -> Vec<u8> {
                self.0.as_bytes().to_vec()
            }

            fn from_key(key: &[u8]) -> Option<Self> {
                Uuid::from_slice(key).ok().map(Self)
            }
        }
    };
}

uuid_key_component!(MailboxId);
uuid_key_component!(MessageId);

impl KeyComponent for Uid {
    fn to_key(&self) -> Vec<u8> {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, u32::from(*self));
        buf.to_vec()
    }

    fn from_key(key: &[u8]) -> Option<Self> {
        if 4 != key.len() {
            return None;
        }

        Uid::of(BigEndian::read_u32(key))
    }
}

impl KeyComponent for u32 {
    fn to_key(&self) -> Vec<u8> {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, *self);
        buf.to_vec()
    }

    fn from_key(key: &[u8]) -> Option<Self> {
        if 4 != key.len() {
            return None;
        }

        Some(BigEndian::read_u32(key))
    }
}

impl KeyComponent for String {
    fn to_key(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_key(key: &[u8]) -> Option<Self> {
        String::from_utf8(key.to_vec()).ok()
    }
}

/// Decode a key component read back from `table`.
pub fn key_of<T: KeyComponent>(table: Table, key: &[u8]) -> Result<T, Error> {
    T::from_key(key).ok_or_else(|| Error::CorruptRow {
        table: table.name(),
        reason: format!("bad key {key:?}"),
    })
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    Ok(serde_cbor::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(
    table: Table,
    value: &[u8],
) -> Result<T, Error> {
    serde_cbor::from_slice(value).map_err(|e| Error::CorruptRow {
        table: table.name(),
        reason: e.to_string(),
    })
}

/// Encode a sequence counter value.
///
/// Counters are compared byte-for-byte by compare-and-set, so they use a
/// fixed-width encoding rather than CBOR.
pub fn encode_sequence(value: u64) -> Vec<u8> {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, value);
    buf.to_vec()
}

pub fn decode_sequence(table: Table, value: &[u8]) -> Result<u64, Error> {
    if 8 != value.len() {
        return Err(Error::CorruptRow {
            table: table.name(),
            reason: format!("sequence value has {} bytes", value.len()),
        });
    }

    Ok(BigEndian::read_u64(value))
}

/// Convert a raw counter cell to a non-negative count.
///
/// Counters are maintained by deltas and can drift below zero if an index
/// update was lost; they are clamped rather than trusted.
pub fn counter_value(raw: Option<i64>) -> u64 {
    raw.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uid_keys_sort_numerically() {
        let uids = [1u32, 2, 255, 256, 65536, u32::MAX];
        let keys = uids.iter().map(|&u| Uid::u(u).to_key()).collect::<Vec<_>>();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        assert_eq!(Some(Uid::u(256)), Uid::from_key(&Uid::u(256).to_key()));
        assert_eq!(None, Uid::from_key(&[0, 0, 0, 0]));
        assert_eq!(None, Uid::from_key(&[1]));
    }

    #[test]
    fn uuid_keys() {
        let id = MailboxId::random();
        assert_eq!(Some(id), MailboxId::from_key(&id.to_key()));
        assert_matches!(
            Err(Error::CorruptRow { table: "mailbox", .. }),
            key_of::<MailboxId>(Table::Mailbox, b"short")
        );
    }

    #[test]
    fn sequences_and_counters() {
        assert_eq!(
            42,
            decode_sequence(Table::UidCounter, &encode_sequence(42)).unwrap()
        );
        assert_matches!(
            Err(Error::CorruptRow { .. }),
            decode_sequence(Table::UidCounter, b"x")
        );
        assert_eq!(0, counter_value(None));
        assert_eq!(0, counter_value(Some(-3)));
        assert_eq!(7, counter_value(Some(7)));
    }
}
