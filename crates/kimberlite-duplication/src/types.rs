//! Core data model: decrees, mutations, partition/duplication identity.
//!
//! Mirrors the entity table in the design doc's data model section —
//! [`Decree`], [`Mutation`], [`Gpid`], [`DuplicationEntry`], the
//! in-memory [`DuplicationStatus`], and [`ConfirmEntry`].

use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Monotonically increasing per-partition sequence number for a committed
/// mutation. Never decreases on a given primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Decree(i64);

impl Decree {
    pub const ZERO: Decree = Decree(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    /// The decree immediately following this one.
    pub fn next(self) -> Self {
        Decree(self.0 + 1)
    }
}

impl Display for Decree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Decree {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Decree> for i64 {
    fn from(d: Decree) -> Self {
        d.0
    }
}

/// Per-partition epoch number for the current primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot(i64);

impl Ballot {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A partition identifier: `(app_id, partition_index)`, stable for the
/// partition's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gpid {
    pub app_id: i32,
    pub partition_index: i32,
}

impl Gpid {
    pub fn new(app_id: i32, partition_index: i32) -> Self {
        Self { app_id, partition_index }
    }
}

impl Display for Gpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_id, self.partition_index)
    }
}

/// Integer identifier of a duplication relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DupId(u32);

impl DupId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Display for DupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single update within a mutation: an opaque, type-erased wire payload.
///
/// The duplicator never interprets `opcode`, `serialization_tag`, or
/// `payload` — they are forwarded verbatim to the remote cluster. See
/// design notes on "dynamic type-erased messages".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationUpdate {
    pub opcode: i32,
    pub serialization_tag: u8,
    pub payload: Bytes,
}

/// A committed (or in-flight) mutation read from the private log.
///
/// Immutable once prepared: `decree` and `ballot` are assigned by the
/// consensus layer and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub decree: Decree,
    pub ballot: Ballot,
    pub updates: Vec<MutationUpdate>,
}

impl Mutation {
    pub fn new(decree: Decree, ballot: Ballot, updates: Vec<MutationUpdate>) -> Self {
        Self { decree, ballot, updates }
    }
}

/// A wire message ready to ship to the remote cluster's backlog handler.
///
/// One `Message` corresponds to one [`MutationUpdate`] flattened out of a
/// committed mutation; the duplicator is oblivious to its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub opcode: i32,
    pub serialization_tag: u8,
    pub payload: Bytes,
}

impl From<MutationUpdate> for Message {
    fn from(update: MutationUpdate) -> Self {
        Message {
            opcode: update.opcode,
            serialization_tag: update.serialization_tag,
            payload: update.payload,
        }
    }
}

/// Authoritative status of a duplication relationship, as reported by the
/// meta server or held in the in-memory [`crate::view::DuplicationView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicationStatus {
    /// Just created on the meta server; not yet started.
    Init,
    /// Actively duplicating.
    Start,
    /// Paused by operator or by role change.
    Pause,
    /// Marked for removal; the duplicator is torn down.
    Removed,
}

impl Display for DuplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DuplicationStatus::Init => "INIT",
            DuplicationStatus::Start => "START",
            DuplicationStatus::Pause => "PAUSE",
            DuplicationStatus::Removed => "REMOVED",
        };
        write!(f, "{s}")
    }
}

/// A duplication's authoritative configuration as reported by the meta
/// server, keyed by [`DupId`] within a partition's app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicationEntry {
    pub dupid: DupId,
    pub remote_address: String,
    pub status: DuplicationStatus,
    pub confirmed_decree: Decree,
}

/// A `(dupid, confirmed_decree)` pair sent from host to meta server as the
/// candidate progress to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmEntry {
    pub dupid: DupId,
    pub confirmed_decree: Decree,
}

/// Whether a replica currently owns writes for its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Primary,
    NotPrimary,
}
