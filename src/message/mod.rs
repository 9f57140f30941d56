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

//! Messages: sequence allocation, the denormalised metadata tables, the
//! derived indexes, and the `MessageMapper` which keeps them in step.

mod by_message_id;
mod by_uid;
mod content;
mod find;
mod flags;
pub mod index;
mod mapper;
mod metadata;
mod sequence;
#[cfg(test)]
pub(crate) mod test_support;

pub use self::by_message_id::ByMessageIdTable;
pub use self::by_uid::ByUidTable;
pub use self::content::ContentTable;
pub use self::flags::FlagsUpdateStageResult;
pub use self::index::IndexMaintainer;
pub use self::mapper::MessageMapper;
pub use self::metadata::MessageMetadataTable;
pub use self::sequence::{ModseqProvider, UidProvider};
