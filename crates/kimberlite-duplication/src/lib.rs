//! Cross-cluster asynchronous duplication pipeline for a PacificA/VSR-style
//! replicated partition store.
//!
//! A *duplicator* tails one primary replica's private log, reassembles
//! committed mutations in decree order through a [`batch::MutationBatch`],
//! and ships them to a remote cluster's [`duplicator::BacklogHandler`]. A
//! per-process [`host::DuplicationHost`] owns the set of duplicators for
//! every primary replica on the node and periodically reconciles their
//! progress with a [`host::MetaClient`].
//!
//! ```text
//! private log files ─▶ LogReader ─▶ MutationBatch ─▶ BacklogHandler (ext.)
//!                                                          │
//!                                                          ▼
//!                                            DuplicationView (last_decree)
//!                                                          │
//!                              Host ──periodic sync──▶ MetaClient (ext.)
//! ```
//!
//! This crate owns exactly the duplication core: the RPC transport, the
//! consensus/replication protocol, the mutation-log file format's
//! authoritative definition, and the meta server's own schema are external
//! collaborators reached through [`duplicator::ReplicaHandle`],
//! [`duplicator::BacklogHandler`], and [`host::MetaClient`].

pub mod batch;
pub mod checksum;
pub mod config;
pub mod duplicator;
pub mod error;
pub mod host;
pub mod instrumentation;
pub mod log_reader;
pub mod prepare_list;
pub mod types;
pub mod view;

pub use batch::MutationBatch;
pub use config::DuplicationOptions;
pub use duplicator::{BacklogHandler, Duplicator, DuplicatorHandle, DuplicatorSnapshot, ReplicaHandle};
pub use error::{DuplicationError, Result};
pub use host::{DuplicationHost, DuplicationSyncRequest, DuplicationSyncResponse, HostSnapshot, MetaClient, RpcStatus};
pub use instrumentation::{DuplicationMetrics, DuplicationMetricsSnapshot};
pub use log_reader::LogReader;
pub use prepare_list::PrepareList;
pub use types::{
    Ballot, ConfirmEntry, Decree, DupId, DuplicationEntry, DuplicationStatus, Gpid, Message,
    Mutation, MutationUpdate, ReplicaRole,
};
pub use view::DuplicationView;
