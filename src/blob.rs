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

//! The blob store contract used for message bodies.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tiny_keccak::{Hasher, Sha3};

use crate::model::BlobId;
use crate::support::error::Error;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Save `data`, returning the ID under which it can be read back.
    ///
    /// Saving the same bytes twice yields the same ID.
    async fn save(&self, data: Vec<u8>) -> Result<BlobId, Error>;

    /// Read the blob with the given ID, or fail with `NxBlob`.
    async fn read(&self, id: &BlobId) -> Result<Vec<u8>, Error>;
}

/// Compute the content address of `data`: the lowercase hex of its 256-bit
/// SHA-3.
pub fn content_address(data: &[u8]) -> BlobId {
    let mut sha3 = Sha3::v256();
    sha3.update(data);
    let mut hash = [0u8; 32];
    sha3.finalize(&mut hash);

    let mut id = String::with_capacity(2 * hash.len());
    for &b in &hash {
        let _ = write!(id, "{:02x}", b);
    }

    BlobId(id)
}

/// A `BlobStore` held in memory.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<BlobId, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn save(&self, data: Vec<u8>) -> Result<BlobId, Error> {
        let id = content_address(&data);
        self.blobs
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_insert(data);
        Ok(id)
    }

    async fn read(&self, id: &BlobId) -> Result<Vec<u8>, Error> {
        self.blobs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(Error::NxBlob)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn content_addresses() {
        // SHA3-256 of the empty string
        assert_eq!(
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a",
            content_address(b"").0
        );
        assert_eq!(content_address(b"foo"), content_address(b"foo"));
        assert_ne!(content_address(b"foo"), content_address(b"bar"));
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_save_and_read() {
        let blobs = MemoryBlobStore::new();
        let id = blobs.save(b"hello world".to_vec()).await.unwrap();
        assert_eq!(id, blobs.save(b"hello world".to_vec()).await.unwrap());
        assert_eq!(b"hello world".to_vec(), blobs.read(&id).await.unwrap());
        assert_matches!(
            Err(Error::NxBlob),
            blobs.read(&content_address(b"nothing")).await
        );
    }

    #[test]
    fn save_and_read() {
        run_save_and_read();
    }
}
