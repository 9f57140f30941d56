//-
// Copyright (c) 2020, 2024, Jason Lingle
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

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::FromIterator;
use std::num::NonZeroU32;
use std::str::FromStr;

use chrono::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::support::error::Error;

macro_rules! uuid_identifier {
    ($(#[$meta:meta])* $t:ident) => {
        $(#[$meta])*
        #[derive(
            Deserialize,
            Serialize,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
        )]
        #[serde(transparent)]
        pub struct $t(pub Uuid);

        impl $t {
            /// Generate a new, globally unique identifier.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($t), self.0.hyphenated())
            }
        }
    };
}

uuid_identifier! {
    /// Identifies a mailbox for its entire lifetime.
    ///
    /// Unlike the path, the ID never changes, even across renames. Since there
    /// is no central authority to hand out sequential IDs, these are random
    /// UUIDs.
    MailboxId
}

uuid_identifier! {
    /// Identifies the content of a message.
    ///
    /// A message copied into several mailboxes has the same `MessageId` in
    /// each of them, but a different UID and modseq in each.
    MessageId
}

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are added to the
/// mailbox. UIDs are never reused within a `UidValidity`.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU32::new_unchecked(1)) };
    pub const MAX: Self = unsafe { Uid(NonZeroU32::new_unchecked(u32::MAX)) };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn next(self) -> Option<Self> {
        self.0.get().checked_add(1).and_then(Uid::of)
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> u32 {
        uid.0.get()
    }
}

/// A CONDSTORE "modifier sequence" number.
///
/// Each mailbox has one modseq counter shared by all its messages. Every
/// change to a message (including its creation) is stamped with a value taken
/// from that counter, so modseqs only grow.
///
/// `ZERO` is the "primordial" value of a mailbox that has never had a change
/// allocated. It is never assigned to a message.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
)]
#[serde(transparent)]
pub struct Modseq(pub u64);

impl Modseq {
    pub const ZERO: Self = Modseq(0);

    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Modseq)
    }
}

impl fmt::Debug for Modseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Modseq({})", self.0)
    }
}

impl fmt::Display for Modseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The IMAP `UIDVALIDITY` of a mailbox.
///
/// A fresh random value is chosen whenever a mailbox is created, so a mailbox
/// deleted and re-created at the same path never presents the same
/// (`UidValidity`, `Uid`) pair for two different messages.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct UidValidity(pub u32);

impl UidValidity {
    pub fn random() -> Self {
        loop {
            let v: u32 = rand::random();
            // 0 is not a valid UIDVALIDITY on the wire
            if 0 != v {
                return UidValidity(v);
            }
        }
    }
}

impl fmt::Debug for UidValidity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UidValidity({})", self.0)
    }
}

/// A message flag.
///
/// System flags are represented as top-level enum values. Keywords are in the
/// `Keyword` case.
///
/// The `Display` format of this type is the exact string value that would be
/// sent over the wire. `FromStr` does the reverse conversion, and also
/// understands non-standard casing of the system flags. Flags are stored in
/// their `Display` format.
///
/// Unlike in the IMAP server proper, `\Recent` is a real flag here: it is
/// persisted with the message and cleared by an ordinary flag update.
#[derive(Clone)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Recent,
    Seen,
    Keyword(String),
}

impl Flag {
    fn rank(&self) -> u8 {
        match *self {
            Flag::Answered => 0,
            Flag::Deleted => 1,
            Flag::Draft => 2,
            Flag::Flagged => 3,
            Flag::Recent => 4,
            Flag::Seen => 5,
            Flag::Keyword(_) => 6,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Flag::Answered => write!(f, "\\Answered"),
            &Flag::Deleted => write!(f, "\\Deleted"),
            &Flag::Draft => write!(f, "\\Draft"),
            &Flag::Flagged => write!(f, "\\Flagged"),
            &Flag::Recent => write!(f, "\\Recent"),
            &Flag::Seen => write!(f, "\\Seen"),
            &Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\recent") {
            Ok(Flag::Recent)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.starts_with('\\') {
            Err(Error::NxFlag)
        } else if !s.is_empty() && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

// Keywords are compared ASCII-case-insensitively, which the ordering and
// hashing must agree with.
impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        Ordering::Equal == self.cmp(other)
    }
}

impl Eq for Flag {}

impl PartialOrd for Flag {
    fn partial_cmp(&self, other: &Flag) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Flag {
    fn cmp(&self, other: &Flag) -> Ordering {
        match (self, other) {
            (&Flag::Keyword(ref a), &Flag::Keyword(ref b)) => a
                .bytes()
                .map(|c| c.to_ascii_lowercase())
                .cmp(b.bytes().map(|c| c.to_ascii_lowercase())),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Flag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        if let Flag::Keyword(ref kw) = *self {
            for c in kw.bytes() {
                c.to_ascii_lowercase().hash(state);
            }
        }
    }
}

impl Serialize for Flag {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A set of flags.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(BTreeSet<Flag>);

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, flag: &Flag) -> bool {
        self.0.contains(flag)
    }

    /// Add `flag`, returning whether it was not already present.
    pub fn insert(&mut self, flag: Flag) -> bool {
        self.0.insert(flag)
    }

    /// Remove `flag`, returning whether it was present.
    pub fn remove(&mut self, flag: &Flag) -> bool {
        self.0.remove(flag)
    }

    pub fn with(mut self, flag: Flag) -> Self {
        self.insert(flag);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> + '_ {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_seen(&self) -> bool {
        self.contains(&Flag::Seen)
    }

    pub fn is_recent(&self) -> bool {
        self.contains(&Flag::Recent)
    }

    pub fn is_deleted(&self) -> bool {
        self.contains(&Flag::Deleted)
    }

    pub fn union(&self, other: &Flags) -> Flags {
        self.0.union(&other.0).cloned().collect()
    }

    pub fn difference(&self, other: &Flags) -> Flags {
        self.0.difference(&other.0).cloned().collect()
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

impl FromIterator<Flag> for Flags {
    fn from_iter<I: IntoIterator<Item = Flag>>(iter: I) -> Self {
        Flags(iter.into_iter().collect())
    }
}

impl Extend<Flag> for Flags {
    fn extend<I: IntoIterator<Item = Flag>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl<'a> IntoIterator for &'a Flags {
    type Item = &'a Flag;
    type IntoIter = std::collections::btree_set::Iter<'a, Flag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// How a `FlagsUpdateCalculator` combines its flags with a message's current
/// flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagsUpdateMode {
    /// The new flags are the union of the old and the given flags.
    Add,
    /// The new flags are the old flags minus the given flags.
    Remove,
    /// The new flags are exactly the given flags.
    Replace,
}

/// Computes the new flags of each message in a flag update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagsUpdateCalculator {
    pub flags: Flags,
    pub mode: FlagsUpdateMode,
}

impl FlagsUpdateCalculator {
    pub fn new(mode: FlagsUpdateMode, flags: Flags) -> Self {
        Self { flags, mode }
    }

    pub fn apply(&self, old: &Flags) -> Flags {
        match self.mode {
            FlagsUpdateMode::Add => old.union(&self.flags),
            FlagsUpdateMode::Remove => old.difference(&self.flags),
            FlagsUpdateMode::Replace => self.flags.clone(),
        }
    }
}

/// A contiguous range of UIDs within one mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageRange {
    One(Uid),
    /// All UIDs greater than or equal to the given one.
    From(Uid),
    /// An inclusive range. `Range(a, b)` with `a > b` is empty.
    Range(Uid, Uid),
    All,
}

impl MessageRange {
    /// Create an inclusive range, accepting the endpoints in either order.
    pub fn range(a: Uid, b: Uid) -> Self {
        if a == b {
            MessageRange::One(a)
        } else {
            MessageRange::Range(a.min(b), a.max(b))
        }
    }

    /// The smallest UID included in the range.
    pub fn lower(self) -> Uid {
        match self {
            MessageRange::One(uid)
            | MessageRange::From(uid)
            | MessageRange::Range(uid, _) => uid,
            MessageRange::All => Uid::MIN,
        }
    }

    /// The largest UID included in the range, or `None` if unbounded.
    pub fn upper(self) -> Option<Uid> {
        match self {
            MessageRange::One(uid) | MessageRange::Range(_, uid) => Some(uid),
            MessageRange::From(_) | MessageRange::All => None,
        }
    }

    pub fn contains(self, uid: Uid) -> bool {
        uid >= self.lower() && self.upper().map_or(true, |upper| uid <= upper)
    }

    /// Narrow this range to UIDs greater than or equal to `start`.
    ///
    /// Returns `None` if nothing is left.
    pub fn starting_at(self, start: Uid) -> Option<Self> {
        let lower = self.lower().max(start);
        match self.upper() {
            None => Some(MessageRange::From(lower)),
            Some(upper) if lower <= upper => {
                Some(MessageRange::range(lower, upper))
            },
            Some(_) => None,
        }
    }
}

/// Locates one message in one mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComposedMessageId {
    pub mailbox_id: MailboxId,
    pub message_id: MessageId,
    pub uid: Uid,
}

/// The compare-and-set protected record of a message placed in a mailbox.
///
/// The same record is stored twice: once keyed by (mailbox, UID) and once
/// keyed by (message ID, mailbox). Both copies are supposed to be identical;
/// the former is authoritative.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    pub mailbox_id: MailboxId,
    pub message_id: MessageId,
    pub uid: Uid,
    pub flags: Flags,
    pub modseq: Modseq,
}

impl MessageRecord {
    pub fn composed_id(&self) -> ComposedMessageId {
        ComposedMessageId {
            mailbox_id: self.mailbox_id,
            message_id: self.message_id,
            uid: self.uid,
        }
    }

    /// Return a copy of this record with different flags and modseq.
    pub fn with_flags(&self, flags: Flags, modseq: Modseq) -> Self {
        Self {
            flags,
            modseq,
            ..self.clone()
        }
    }
}

/// The outcome of changing the flags of one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatedFlags {
    pub uid: Uid,
    pub message_id: MessageId,
    /// The modseq of the message after the update. If the flags did not
    /// actually change, this is the message's unchanged modseq.
    pub modseq: Modseq,
    pub old_flags: Flags,
    pub new_flags: Flags,
}

impl UpdatedFlags {
    pub fn flags_changed(&self) -> bool {
        self.old_flags != self.new_flags
    }

    /// Whether `flag` was added (`Some(true)`), removed (`Some(false)`), or
    /// left alone (`None`) by this update.
    pub fn became(&self, flag: &Flag) -> Option<bool> {
        match (self.old_flags.contains(flag), self.new_flags.contains(flag)) {
            (false, true) => Some(true),
            (true, false) => Some(false),
            _ => None,
        }
    }
}

/// The namespace for mailboxes owned by a user.
pub const PRIVATE_NAMESPACE: &str = "#private";

/// The full name of a mailbox.
///
/// The `Display` format is `namespace:user:name`, with an empty user for
/// mailboxes not owned by anyone. `FromStr` parses the same format.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct MailboxPath {
    pub namespace: String,
    pub user: Option<String>,
    pub name: String,
}

impl MailboxPath {
    pub fn new(
        namespace: &str,
        user: Option<&str>,
        name: &str,
    ) -> Result<Self, Error> {
        let safe_part =
            |s: &str| !s.is_empty() && !s.contains(':') && !has_control(s);
        if !safe_part(namespace)
            || !user.map_or(true, safe_part)
            || name.is_empty()
            || has_control(name)
        {
            return Err(Error::UnsafeName);
        }

        Ok(Self {
            namespace: namespace.to_owned(),
            user: user.map(str::to_owned),
            name: name.to_owned(),
        })
    }

    /// The path of mailbox `name` in the private namespace of `user`.
    pub fn for_user(user: &str, name: &str) -> Result<Self, Error> {
        Self::new(PRIVATE_NAMESPACE, Some(user), name)
    }
}

fn has_control(s: &str) -> bool {
    s.chars().any(char::is_control)
}

impl fmt::Display for MailboxPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.namespace,
            self.user.as_deref().unwrap_or(""),
            self.name,
        )
    }
}

impl FromStr for MailboxPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(user), Some(name)) => MailboxPath::new(
                namespace,
                Some(user).filter(|u| !u.is_empty()),
                name,
            ),
            _ => Err(Error::UnsafeName),
        }
    }
}

/// Access rights on a mailbox, from identifier to RFC 4314 rights string.
pub type MailboxAcl = BTreeMap<String, String>;

/// A row of the mailbox directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mailbox {
    pub id: MailboxId,
    pub path: MailboxPath,
    pub uid_validity: UidValidity,
    pub acl: MailboxAcl,
}

/// Approximate message counts of a mailbox, served from the derived indexes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MailboxCounters {
    pub count: u64,
    pub unseen: u64,
}

/// A message being added to a mailbox for the first time.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub internal_date: DateTime<FixedOffset>,
    pub flags: Flags,
    pub body: Vec<u8>,
}

/// Content-addressed identifier of a blob.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct BlobId(pub String);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Information about the content of a message, shared by all its copies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub message_id: MessageId,
    pub size: u64,
    pub internal_date: DateTime<FixedOffset>,
    pub blob_id: BlobId,
}

/// How much of a message a read should load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchType {
    /// Only the metadata record.
    Metadata,
    /// The metadata record, the content record, and the body.
    Full,
}

/// A message as returned by `MessageMapper::find_in_mailbox`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedMessage {
    pub record: MessageRecord,
    /// Present only for `FetchType::Full`.
    pub full: Option<FullContent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FullContent {
    pub content: MessageContent,
    pub body: Vec<u8>,
}
