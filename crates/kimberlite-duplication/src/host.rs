//! Per-process coordinator: owns every primary replica's duplicators and
//! periodically reconciles progress with the meta server.
//!
//! Mirrors `replica_stub_duplication.cpp`'s `duplication_sync` /
//! `on_duplication_sync_reply` pair, folded into one async method since
//! there is no separate RPC-callback re-entry point in this adaptation —
//! `sync_once` performs the request, awaits the reply inline, and applies
//! it before returning, with the same single-flight gating and
//! unconditional release the original gets from a scope guard.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::DuplicationOptions;
use crate::duplicator::{BacklogHandler, Duplicator, DuplicatorHandle, ReplicaHandle};
use crate::error::{DuplicationError, Result};
use crate::instrumentation::DuplicationMetrics;
use crate::types::{
    ConfirmEntry, Decree, DupId, DuplicationEntry, DuplicationStatus, Gpid, ReplicaRole,
};

/// Outcome of a `duplication_sync` RPC, mirroring the `ErrorCode` the
/// original meta-client call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcStatus {
    Ok,
    Err(String),
}

#[derive(Debug, Clone)]
pub struct DuplicationSyncRequest {
    pub node: String,
    pub confirm_list: BTreeMap<Gpid, Vec<ConfirmEntry>>,
}

#[derive(Debug, Clone)]
pub struct DuplicationSyncResponse {
    pub err: RpcStatus,
    pub dup_map: BTreeMap<i32, Vec<DuplicationEntry>>,
}

/// Thin RPC stub to the meta server; the real transport is external.
pub trait MetaClient: Send + Sync {
    fn duplication_sync(
        &self,
        request: DuplicationSyncRequest,
    ) -> impl std::future::Future<Output = Result<DuplicationSyncResponse>> + Send;
}

struct ReplicaState<R> {
    replica: Arc<R>,
    duplicators: HashMap<DupId, DuplicatorHandle>,
}

#[derive(Debug, Clone)]
pub struct HostSnapshot {
    pub tracked_replicas: usize,
    pub sync_in_progress: bool,
}

/// Per-process singleton coordinating duplication across every primary
/// replica on this node.
pub struct DuplicationHost<R, B, M> {
    node_address: String,
    options: Arc<DuplicationOptions>,
    meta: Arc<M>,
    backlog_factory: Arc<dyn Fn(&str) -> Arc<B> + Send + Sync>,
    replicas: Mutex<HashMap<Gpid, ReplicaState<R>>>,
    sync_in_progress: Arc<AtomicBool>,
    metrics: DuplicationMetrics,
}

impl<R, B, M> DuplicationHost<R, B, M>
where
    R: ReplicaHandle + 'static,
    B: BacklogHandler + 'static,
    M: MetaClient + 'static,
{
    pub fn new(
        node_address: String,
        options: Arc<DuplicationOptions>,
        meta: Arc<M>,
        backlog_factory: impl Fn(&str) -> Arc<B> + Send + Sync + 'static,
    ) -> Self {
        Self {
            node_address,
            options,
            meta,
            backlog_factory: Arc::new(backlog_factory),
            replicas: Mutex::new(HashMap::new()),
            sync_in_progress: Arc::new(AtomicBool::new(false)),
            metrics: DuplicationMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &DuplicationMetrics {
        &self.metrics
    }

    /// Read-only lookup of one duplicator's shared view, for callers
    /// wiring up their own command-manager-style introspection — the
    /// host itself never registers anything against a process-wide
    /// registry.
    pub fn duplicator_view(&self, gpid: Gpid, dupid: DupId) -> Option<crate::view::DuplicationView> {
        let replicas = self.replicas.lock().unwrap();
        let handle = replicas.get(&gpid)?.duplicators.get(&dupid)?;
        Some(handle.view().clone())
    }

    pub fn snapshot(&self) -> HostSnapshot {
        HostSnapshot {
            tracked_replicas: self.replicas.lock().unwrap().len(),
            sync_in_progress: self.sync_in_progress.load(Ordering::SeqCst),
        }
    }

    /// Starts tracking a replica that just became primary. A no-op if
    /// already tracked.
    pub fn add_primary_replica(&self, replica: Arc<R>) {
        let gpid = replica.gpid();
        self.replicas
            .lock()
            .unwrap()
            .entry(gpid)
            .or_insert_with(|| ReplicaState { replica, duplicators: HashMap::new() });
    }

    /// Stops tracking `gpid` entirely, pausing and joining every
    /// duplicator it owned. Called on primary demotion or replica
    /// teardown.
    pub async fn remove_replica(&self, gpid: Gpid) {
        let entry = self.replicas.lock().unwrap().remove(&gpid);
        if let Some(entry) = entry {
            for (_, handle) in entry.duplicators {
                handle.shutdown().await;
            }
        }
    }

    /// The log-GC barrier for `gpid`: the minimum `confirmed_decree` over
    /// its live (non-`Removed`) duplicators, or `None` meaning unbounded
    /// (no barrier) — used both when `gpid` has no duplicators and when
    /// it isn't a tracked primary at all.
    pub fn min_confirmed_decree(&self, gpid: Gpid) -> Option<Decree> {
        let replicas = self.replicas.lock().unwrap();
        let entry = replicas.get(&gpid)?;
        if entry.replica.status() != ReplicaRole::Primary {
            return None;
        }

        let mut min: Option<Decree> = None;
        for handle in entry.duplicators.values() {
            let (_, confirmed_decree, status) = handle.view().snapshot();
            if status == DuplicationStatus::Removed {
                continue;
            }
            debug_assert!(confirmed_decree.get() >= 0, "confirmed_decree must never go negative");
            min = Some(min.map_or(confirmed_decree, |m| m.min(confirmed_decree)));
        }
        min
    }

    /// Runs one periodic sync tick: collects progress, calls the meta
    /// server, and applies its authoritative reply. Returns `Ok(())` even
    /// on a transport failure or `err != Ok` reply — those retry on the
    /// next tick per design, not via `Err`. Only a fatal reconciliation
    /// failure (unknown status, truncated log) returns `Err`.
    pub async fn sync_once(&self) -> Result<()> {
        if self
            .sync_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.metrics.record_sync_skipped_in_flight();
            tracing::debug!("duplication sync already in flight, skipping this tick");
            return Ok(());
        }

        self.metrics.record_sync_tick();
        let result = self.sync_once_inner().await;
        if result.is_err() {
            self.metrics.record_sync_failure();
        }
        self.sync_in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn sync_once_inner(&self) -> Result<()> {
        let confirm_list = self.collect_confirm_list();
        let request = DuplicationSyncRequest {
            node: self.node_address.clone(),
            confirm_list,
        };

        let response = match self.meta.duplication_sync(request).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "duplication_sync RPC failed, retrying next tick");
                return Ok(());
            }
        };

        if response.err != RpcStatus::Ok {
            tracing::warn!(err = ?response.err, "meta rejected duplication_sync, retrying next tick");
            return Ok(());
        }

        self.apply_meta_reply(&response.dup_map).await
    }

    fn collect_confirm_list(&self) -> BTreeMap<Gpid, Vec<ConfirmEntry>> {
        let replicas = self.replicas.lock().unwrap();
        let mut out = BTreeMap::new();
        for (gpid, entry) in replicas.iter() {
            if entry.replica.status() != ReplicaRole::Primary {
                continue;
            }
            let mut confirms = Vec::new();
            for (dupid, handle) in &entry.duplicators {
                let (last_decree, confirmed_decree, _) = handle.view().snapshot();
                if last_decree != confirmed_decree {
                    confirms.push(ConfirmEntry { dupid: *dupid, confirmed_decree: last_decree });
                }
            }
            if !confirms.is_empty() {
                out.insert(*gpid, confirms);
            }
        }
        out
    }

    async fn apply_meta_reply(&self, dup_map: &BTreeMap<i32, Vec<DuplicationEntry>>) -> Result<()> {
        let tracked: Vec<(Gpid, bool)> = {
            let replicas = self.replicas.lock().unwrap();
            replicas
                .iter()
                .map(|(gpid, entry)| (*gpid, entry.replica.status() == ReplicaRole::Primary))
                .collect()
        };

        for (gpid, is_primary) in tracked {
            if !is_primary {
                self.remove_all_duplications(gpid).await;
                continue;
            }

            match dup_map.get(&gpid.app_id) {
                Some(entries) => {
                    for entry in entries {
                        self.sync_duplication(gpid, entry).await?;
                    }
                }
                None => self.remove_all_duplications(gpid).await,
            }
        }

        Ok(())
    }

    /// Reconciles one duplication entry against the replica's current
    /// state: creates, starts, pauses, or removes the duplicator as
    /// needed, then advances its `confirmed_decree`.
    async fn sync_duplication(&self, gpid: Gpid, entry: &DuplicationEntry) -> Result<()> {
        enum Action {
            Create,
            NoOp,
            Start,
            Pause,
            Remove,
        }

        let action = {
            let replicas = self.replicas.lock().unwrap();
            match replicas.get(&gpid).and_then(|r| r.duplicators.get(&entry.dupid)) {
                None => Action::Create,
                Some(handle) => {
                    let current = handle.view().status();
                    if current == entry.status {
                        Action::NoOp
                    } else {
                        match entry.status {
                            DuplicationStatus::Start => Action::Start,
                            DuplicationStatus::Pause => Action::Pause,
                            DuplicationStatus::Removed => Action::Remove,
                            DuplicationStatus::Init => {
                                return Err(DuplicationError::Fatal(format!(
                                    "meta requested unexpected status INIT for dupid {} on {gpid}",
                                    entry.dupid
                                )));
                            }
                        }
                    }
                }
            }
        };

        match action {
            Action::NoOp => {}
            Action::Create => {
                let replica = {
                    let replicas = self.replicas.lock().unwrap();
                    replicas.get(&gpid).map(|r| Arc::clone(&r.replica))
                };
                let Some(replica) = replica else { return Ok(()) };

                let backlog = (self.backlog_factory)(&entry.remote_address);
                let duplicator = Duplicator::new(
                    entry.dupid,
                    entry.remote_address.clone(),
                    replica,
                    backlog,
                    Arc::clone(&self.options),
                    entry.confirmed_decree,
                )?;
                duplicator.view().set_status(entry.status);
                let handle = duplicator.spawn();
                if entry.status == DuplicationStatus::Start {
                    handle.start();
                }

                let mut replicas = self.replicas.lock().unwrap();
                if let Some(r) = replicas.get_mut(&gpid) {
                    r.duplicators.insert(entry.dupid, handle);
                }
            }
            Action::Start => {
                let replicas = self.replicas.lock().unwrap();
                if let Some(handle) = replicas.get(&gpid).and_then(|r| r.duplicators.get(&entry.dupid)) {
                    handle.view().set_status(DuplicationStatus::Start);
                    handle.start();
                }
            }
            Action::Pause => {
                let replicas = self.replicas.lock().unwrap();
                if let Some(handle) = replicas.get(&gpid).and_then(|r| r.duplicators.get(&entry.dupid)) {
                    handle.view().set_status(DuplicationStatus::Pause);
                    handle.pause();
                }
            }
            Action::Remove => {
                let handle = {
                    let mut replicas = self.replicas.lock().unwrap();
                    replicas.get_mut(&gpid).and_then(|r| r.duplicators.remove(&entry.dupid))
                };
                if let Some(handle) = handle {
                    handle.view().set_status(DuplicationStatus::Removed);
                    handle.shutdown().await;
                }
            }
        }

        let replicas = self.replicas.lock().unwrap();
        if let Some(handle) = replicas.get(&gpid).and_then(|r| r.duplicators.get(&entry.dupid)) {
            handle.view().advance_confirmed_decree(entry.confirmed_decree);
        }

        Ok(())
    }

    async fn remove_all_duplications(&self, gpid: Gpid) {
        let handles: Vec<DuplicatorHandle> = {
            let mut replicas = self.replicas.lock().unwrap();
            match replicas.get_mut(&gpid) {
                Some(entry) => entry.duplicators.drain().map(|(_, h)| h).collect(),
                None => Vec::new(),
            }
        };
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
