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

use futures::stream::BoxStream;
use log::{info, warn};

use super::directory::MailboxDirectory;
use super::path_index::PathIndex;
use crate::message::{ModseqProvider, UidProvider};
use crate::model::*;
use crate::storage::ColumnStore;
use crate::support::{
    error::Error, log_prefix::LogPrefix, system_config::MapperConfig,
};

/// Creates, renames, and deletes mailboxes.
///
/// Every operation here is a sequence of independent single-row writes to the
/// directory and the path index. A failure part way through can leave the two
/// disagreeing; `repair::PathRepairService` finds and heals those cases.
#[derive(Clone)]
pub struct MailboxMapper {
    log_prefix: LogPrefix,
    directory: MailboxDirectory,
    path_index: PathIndex,
    uids: UidProvider,
    modseqs: ModseqProvider,
}

impl MailboxMapper {
    pub fn new(
        log_prefix: LogPrefix,
        store: Arc<dyn ColumnStore>,
        config: &MapperConfig,
    ) -> Self {
        Self {
            log_prefix,
            directory: MailboxDirectory::new(Arc::clone(&store)),
            path_index: PathIndex::new(Arc::clone(&store)),
            uids: UidProvider::new(Arc::clone(&store), config),
            modseqs: ModseqProvider::new(store, config),
        }
    }

    /// Create a new, empty mailbox at `path`.
    ///
    /// Fails with `MailboxExists` if the path index already has an entry for
    /// `path`, even if that entry is an orphan.
    pub async fn create(&self, path: MailboxPath) -> Result<Mailbox, Error> {
        let mailbox = Mailbox {
            id: MailboxId::random(),
            path,
            uid_validity: UidValidity::random(),
            acl: MailboxAcl::new(),
        };

        if !self.path_index.try_save(&mailbox.path, mailbox.id).await? {
            return Err(Error::MailboxExists);
        }

        if let Err(e) = self.directory.save(&mailbox).await {
            self.release_path(&mailbox.path, mailbox.id).await;
            return Err(e);
        }

        info!(
            "{} Created mailbox {} as {}",
            self.log_prefix, mailbox.path, mailbox.id
        );
        Ok(mailbox)
    }

    /// Move mailbox `id` to `new_path`.
    ///
    /// The old path is released only after the directory has been updated.
    pub async fn rename(
        &self,
        id: MailboxId,
        new_path: MailboxPath,
    ) -> Result<Mailbox, Error> {
        let old = self.find_by_id(id).await?;
        if old.path == new_path {
            return Ok(old);
        }

        if !self.path_index.try_save(&new_path, id).await? {
            return Err(Error::MailboxExists);
        }

        let renamed = Mailbox {
            path: new_path,
            ..old.clone()
        };
        if let Err(e) = self.directory.save(&renamed).await {
            self.release_path(&renamed.path, id).await;
            return Err(e);
        }

        if let Err(e) = self.path_index.delete_if_points_to(&old.path, id).await
        {
            warn!(
                "{} Renamed {} to {}, but the old path could not be \
                 released: {e}",
                self.log_prefix, old.path, renamed.path
            );
            return Err(e);
        }

        info!(
            "{} Renamed mailbox {} from {} to {}",
            self.log_prefix, id, old.path, renamed.path
        );
        Ok(renamed)
    }

    /// Delete the mailbox `id`.
    ///
    /// The path row goes first, then the directory row, then the sequence
    /// counters. Messages and index rows are not touched; callers expunge the
    /// mailbox before deleting it.
    pub async fn delete(&self, id: MailboxId) -> Result<(), Error> {
        let mailbox = self.find_by_id(id).await?;
        self.path_index
            .delete_if_points_to(&mailbox.path, id)
            .await?;
        self.directory.delete(id).await?;

        let (uids, modseqs) =
            tokio::join!(self.uids.forget(id), self.modseqs.forget(id));
        if let Err(e) = uids.and(modseqs) {
            warn!(
                "{} Deleted mailbox {}, but its sequence counters \
                 remain: {e}",
                self.log_prefix, id
            );
        }

        info!("{} Deleted mailbox {} ({})", self.log_prefix, mailbox.path, id);
        Ok(())
    }

    /// Look a mailbox up by path.
    ///
    /// A path index entry whose directory row is missing is treated as not
    /// existing.
    pub async fn find_by_path(
        &self,
        path: &MailboxPath,
    ) -> Result<Mailbox, Error> {
        let id = self
            .path_index
            .retrieve(path)
            .await?
            .ok_or(Error::NxMailbox)?;
        self.find_by_id(id).await
    }

    pub async fn find_by_id(&self, id: MailboxId) -> Result<Mailbox, Error> {
        self.directory.retrieve(id).await?.ok_or(Error::NxMailbox)
    }

    /// Stream every mailbox in the directory.
    pub fn list(&self) -> BoxStream<'static, Result<Mailbox, Error>> {
        self.directory.list()
    }

    async fn release_path(&self, path: &MailboxPath, id: MailboxId) {
        if let Err(e) = self.path_index.delete_if_points_to(path, id).await {
            warn!(
                "{} Failed to release path {} after failed write; \
                 it is now an orphan: {e}",
                self.log_prefix, path
            );
        }
    }
}
