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

use log::error;

use super::main::ServerRecomputeCountersSubcommand;
use crate::mailbox::MailboxMapper;
use crate::migration::Migrations;
use crate::repair::{
    PathRepairService, RecomputeCountersService, RepairResult,
};
use crate::storage::{ColumnStore, SchemaVersion, SchemaVersionStore};
use crate::support::{
    cancel::CancelToken, error::Error, log_prefix::LogPrefix,
    sysexits::*, system_config::MapperConfig,
};

fn exit_code(e: &Error) -> Sysexit {
    match *e {
        Error::SchemaVersionTooOld { .. } => EX_CONFIG,
        Error::NxMailbox => EX_NOINPUT,
        ref e if e.is_transient() => EX_TEMPFAIL,
        _ => EX_SOFTWARE,
    }
}

pub(super) async fn repair(
    log_prefix: LogPrefix,
    store: Arc<dyn ColumnStore>,
) -> Sysexit {
    log_prefix.set_task("repair".to_owned());
    let service = PathRepairService::new(log_prefix.clone(), store);
    let outcome = match service.run(&CancelToken::new()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("{} Repair not started: {}", log_prefix, e);
            eprintln!("Repair not started: {}", e);
            return exit_code(&e);
        },
    };

    let report = &outcome.report;
    println!("result: {:?}", outcome.result);
    println!(
        "processed directory entries: {}",
        report.processed_directory_entries
    );
    println!("processed path entries: {}", report.processed_path_entries);
    println!("fixed inconsistencies: {}", report.fixed_inconsistencies);
    println!("errors: {}", report.errors);
    for conflict in &report.conflicting_entries {
        println!(
            "conflict: mailbox {} at {} vs. path {} -> {}",
            conflict.directory.0,
            conflict.directory.1,
            conflict.path_index.0,
            conflict.path_index.1,
        );
    }

    match outcome.result {
        RepairResult::Completed => EX_OK,
        RepairResult::Partial => EX_SOFTWARE,
    }
}

pub(super) async fn migrate(
    log_prefix: LogPrefix,
    store: Arc<dyn ColumnStore>,
) -> Sysexit {
    let migrations = Migrations::new(log_prefix.child("migrate"), store);
    match migrations.migrate_to(SchemaVersion::LATEST).await {
        Ok(version) => {
            println!("Store is at schema version {}", version);
            EX_OK
        },
        Err(e) => {
            error!("{} Migration failed: {}", log_prefix, e);
            eprintln!("Migration failed: {}", e);
            exit_code(&e)
        },
    }
}

pub(super) async fn schema_version(store: Arc<dyn ColumnStore>) -> Sysexit {
    let versions = SchemaVersionStore::new(store);
    let current = match versions.current().await {
        Ok(current) => current,
        Err(e) => {
            eprintln!("Unable to read schema version: {}", e);
            return exit_code(&e);
        },
    };

    match current {
        None => println!("none (latest is {})", SchemaVersion::LATEST),
        Some(version) => match versions.applied_at(version).await {
            Ok(Some(when)) => println!(
                "{} (applied {}, latest is {})",
                version,
                when.to_rfc3339(),
                SchemaVersion::LATEST
            ),
            Ok(None) | Err(_) => {
                println!("{} (latest is {})", version, SchemaVersion::LATEST)
            },
        },
    }
    EX_OK
}

pub(super) async fn recompute_counters(
    log_prefix: LogPrefix,
    store: Arc<dyn ColumnStore>,
    config: &MapperConfig,
    cmd: ServerRecomputeCountersSubcommand,
) -> Sysexit {
    if let Some(ref user) = cmd.mailbox.user {
        log_prefix.set_user(user.clone());
    }

    let mailboxes = MailboxMapper::new(
        log_prefix.child("mailbox"),
        Arc::clone(&store),
        config,
    );
    let mailbox = match mailboxes.find_by_path(&cmd.mailbox).await {
        Ok(mailbox) => mailbox,
        Err(e) => {
            eprintln!("{}: {}", cmd.mailbox, e);
            return exit_code(&e);
        },
    };

    let service =
        RecomputeCountersService::new(log_prefix.child("recompute"), store);
    match service.recompute(mailbox.id).await {
        Ok(report) => {
            println!(
                "{}: count {} -> {}, unseen {} -> {}, {} index entries \
                 corrected",
                cmd.mailbox,
                report.previous.0,
                report.recomputed.count,
                report.previous.1,
                report.recomputed.unseen,
                report.corrected_memberships
            );
            EX_OK
        },
        Err(e) => {
            error!(
                "{} Recomputing counters of {} failed: {}",
                log_prefix, cmd.mailbox, e
            );
            eprintln!("{}: {}", cmd.mailbox, e);
            exit_code(&e)
        },
    }
}
