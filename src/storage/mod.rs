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

//! Persistence.
//!
//! `column` defines the store contract, `memory` and `sqlite` implement it,
//! and `codec` maps model types onto keys and values.

pub mod codec;
pub mod column;
mod memory;
pub mod schema;
mod sqlite;

pub use self::column::{ColumnStore, Row, RowKey, RowStream, Table};
pub use self::memory::MemoryStore;
pub use self::schema::{SchemaVersion, SchemaVersionStore};
pub use self::sqlite::SqliteStore;
