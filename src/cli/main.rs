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

use std::fs;
use std::io::{self, IsTerminal};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use structopt::StructOpt;

use crate::model::MailboxPath;
use crate::storage::{ColumnStore, SqliteStore};
use crate::support::log_prefix::LogPrefix;
use crate::support::sysexits::*;
use crate::support::system_config::StoreConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Commands to be run on the system hosting the store.
    Server(ServerSubcommand),
}

#[derive(StructOpt, Default)]
pub(super) struct ServerCommonOptions {
    /// The directory containing `cstore.toml` etc
    /// [default: /etc/crymap or /usr/local/etc/crymap]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

#[derive(StructOpt)]
enum ServerSubcommand {
    /// Reconcile the mailbox directory with the mailbox path index.
    ///
    /// Mailboxes missing from the path index are put back, and path index
    /// entries for mailboxes which no longer exist are removed. Entries where
    /// the two tables name different mailboxes are only reported; those need
    /// to be merged by hand.
    ///
    /// Exits with EX_SOFTWARE if anything was left unrepaired, and with
    /// EX_CONFIG if the store has not been migrated far enough for this to
    /// be safe.
    Repair(ServerCommonOptions),
    /// Bring the store up to the latest schema version.
    Migrate(ServerCommonOptions),
    /// Print the schema version of the store.
    SchemaVersion(ServerCommonOptions),
    RecomputeCounters(ServerRecomputeCountersSubcommand),
}

impl ServerSubcommand {
    fn common_options(&mut self) -> ServerCommonOptions {
        match *self {
            ServerSubcommand::Repair(ref mut c)
            | ServerSubcommand::Migrate(ref mut c)
            | ServerSubcommand::SchemaVersion(ref mut c) => mem::take(c),
            ServerSubcommand::RecomputeCounters(ref mut c) => {
                mem::take(&mut c.common)
            },
        }
    }
}

/// Recompute the message and unseen counters of a mailbox.
///
/// The counters are derived by scanning every message in the mailbox. Run
/// this while the mailbox is not being modified.
#[derive(StructOpt)]
pub(super) struct ServerRecomputeCountersSubcommand {
    #[structopt(flatten)]
    pub(super) common: ServerCommonOptions,

    /// The mailbox, as `namespace:user:name`, e.g. `#private:alice:INBOX`.
    #[structopt(parse(try_from_str))]
    pub(super) mailbox: MailboxPath,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    match cmd {
        Command::Server(cmd) => server(cmd),
    }
}

fn server(mut cmd: ServerSubcommand) {
    let common = cmd.common_options();
    let root = common.root.unwrap_or_else(|| {
        if Path::new("/etc/crymap/cstore.toml").is_file() {
            "/etc/crymap".to_owned().into()
        } else if Path::new("/usr/local/etc/crymap/cstore.toml").is_file() {
            "/usr/local/etc/crymap".to_owned().into()
        } else {
            die!(
                EX_CONFIG,
                "Neither /etc/crymap nor /usr/local/etc/crymap has a\n\
                 cstore.toml; use --root=/path/to/crymap if your\n\
                 installation is elsewhere."
            )
        }
    });

    let config_path = root.join("cstore.toml");
    let config = match fs::read_to_string(&config_path) {
        Ok(text) => match StoreConfig::parse(&text) {
            Ok(config) => config,
            Err(e) => die!(
                EX_CONFIG,
                "Error in config file at '{}': {}",
                config_path.display(),
                e
            ),
        },
        Err(e) if io::ErrorKind::NotFound == e.kind() => StoreConfig::default(),
        Err(e) => die!(
            EX_CONFIG,
            "Error reading '{}': {}",
            config_path.display(),
            e
        ),
    };

    if io::stderr().is_terminal() {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
    } else {
        let log_config_file = root.join("logging.toml");
        if log_config_file.is_file() {
            log4rs::init_file(log_config_file, Default::default())
            .expect("Failed to initialise logging");
        } else {
            crate::init_simple_log();
        }
    }

    let log_prefix = LogPrefix::new("cstore".to_owned());
    let db_path = root.join(&config.storage.sqlite_path);
    let store: Arc<dyn ColumnStore> =
        match SqliteStore::open(&log_prefix, &db_path) {
            Ok(store) => Arc::new(store),
            Err(e) => die!(
                EX_UNAVAILABLE,
                "Unable to open '{}': {}",
                db_path.display(),
                e
            ),
        };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => die!(EX_SOFTWARE, "Failed to start runtime: {}", e),
    };

    let status = runtime.block_on(async move {
        match cmd {
            ServerSubcommand::Repair(_) => {
                super::admin::repair(log_prefix, store).await
            },
            ServerSubcommand::Migrate(_) => {
                super::admin::migrate(log_prefix, store).await
            },
            ServerSubcommand::SchemaVersion(_) => {
                super::admin::schema_version(store).await
            },
            ServerSubcommand::RecomputeCounters(cmd) => {
                super::admin::recompute_counters(
                    log_prefix,
                    store,
                    &config.mapper,
                    cmd,
                )
                .await
            },
        }
    });

    if EX_OK != status {
        status.exit();
    }
}
