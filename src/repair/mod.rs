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

//! Background jobs which bring denormalised tables back in line with their
//! authoritative counterparts.

mod context;
mod counters;
mod paths;

pub use self::context::{ConflictingEntry, Context, RepairReport};
pub use self::counters::{RecomputeCountersService, RecomputeReport};
pub use self::paths::{
    Inconsistency, PathRepairService, RepairOutcome, RepairResult,
};
