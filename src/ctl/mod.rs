//! Group controller.
//!
//! A single task owns all pending dependency state of a device. It receives objectives from
//! `GroupHandle`s, submits groups to the group service in dependency order, and advances group
//! chains as confirmations arrive, either as group events or through the periodic
//! reconciliation sweep. Registration and resolution are serialized on this task, so a
//! registrant can never race the resolution of its prerequisite.

mod emitter;
mod handle;
#[cfg(test)]
mod mod_test;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::chain::{ChainBuilder, ChainPlan, GroupChainElem};
use crate::config::Config;
use crate::error::{ObjectiveError, ShutdownResult};
use crate::ident;
use crate::models::{DeviceId, GroupBucket, GroupDescriptor, GroupEvent, GroupEventKind, GroupId, GroupKey, Instruction, NextGroup, NextObjective, PortNumber, Treatment};
use crate::pending::{PendingNextGroup, PendingTracker, Resolution};
use crate::service::GroupService;
use crate::store::NextGroupStore;

use emitter::{report, InstallReply};
pub use emitter::ResultEmitter;
pub use handle::GroupHandle;

const METRIC_GROUPS_SUBMITTED: &str = "groupchain_groups_submitted";
const METRIC_OBJECTIVES_INSTALLED: &str = "groupchain_objectives_installed";
const METRIC_OBJECTIVES_FAILED: &str = "groupchain_objectives_failed";
const METRIC_PENDING_GROUPS: &str = "groupchain_pending_groups";
const METRIC_PENDING_OBJECTIVES: &str = "groupchain_pending_objectives";

/// The capacity of the controller's request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 1000;

/// A request sent to a group controller.
pub enum GroupCtlMsg {
    /// Install the given plan.
    Install {
        plan: ChainPlan,
        objective: Arc<NextObjective>,
        tx: InstallReply,
    },
    /// Add a bucket chain to an installed, or pending, hashed objective.
    AddBucket {
        plan: ChainPlan,
        objective: Arc<NextObjective>,
        tx: InstallReply,
    },
    /// Remove the bucket chain of a hashed objective which terminates at the given port.
    RemoveBucket {
        objective: Arc<NextObjective>,
        port: PortNumber,
        tx: InstallReply,
    },
    /// Remove every group of an installed objective.
    Remove {
        objective: Arc<NextObjective>,
        tx: oneshot::Sender<Result<(), ObjectiveError>>,
    },
}

/// An add-bucket request parked until its objective completes.
struct DeferredBucket {
    plan: ChainPlan,
    objective: Arc<NextObjective>,
    tx: InstallReply,
}

/// A unit of work of the controller's work queue.
enum Work {
    /// Submit a group creation.
    Create(GroupDescriptor),
    /// Submit a bucket addition to an existing group.
    AddBuckets(GroupDescriptor),
    /// Resolve a confirmed group key.
    Resolve(GroupKey),
}

/// The group controller of a single device.
pub struct GroupCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The device whose groups this controller manages.
    device_id: DeviceId,
    /// The device's group table.
    service: Arc<dyn GroupService>,
    /// The store of installed objective records.
    store: NextGroupStore,
    /// The reporter of objective outcomes.
    emitter: ResultEmitter,

    /// Both registries of pending dependencies.
    tracker: PendingTracker,
    /// Keys whose creation was requested and not yet confirmed.
    requested: HashSet<GroupKey>,
    /// Add-bucket requests waiting on the completion of their objective, by objective id.
    deferred: HashMap<u32, DeferredBucket>,

    /// A channel of inbound requests.
    requests_rx: ReceiverStream<GroupCtlMsg>,
    /// The group event stream of the device.
    events: BroadcastStream<GroupEvent>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl GroupCtl {
    /// Create a new instance, along with the handle used to drive it.
    pub fn new(config: Arc<Config>, store: NextGroupStore, service: Arc<dyn GroupService>, shutdown_tx: broadcast::Sender<()>) -> (Self, GroupHandle) {
        metrics::register_counter!(METRIC_GROUPS_SUBMITTED, metrics::Unit::Count, "the number of groups submitted to the device");
        metrics::register_counter!(METRIC_OBJECTIVES_INSTALLED, metrics::Unit::Count, "the number of next objectives installed");
        metrics::register_counter!(METRIC_OBJECTIVES_FAILED, metrics::Unit::Count, "the number of next objectives which failed");
        metrics::register_gauge!(METRIC_PENDING_GROUPS, metrics::Unit::Count, "the number of groups with waiting chain elements");
        metrics::register_gauge!(METRIC_PENDING_OBJECTIVES, metrics::Unit::Count, "the number of next objectives awaiting confirmation");

        let device_id = config.device_id();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let handle = GroupHandle::new(ChainBuilder::new(device_id.clone()), requests_tx);
        let events = BroadcastStream::new(service.subscribe());
        let ctl = Self {
            tracker: PendingTracker::new(config.pending_expiry()),
            config,
            device_id,
            service,
            emitter: ResultEmitter::new(store.clone()),
            store,
            requested: HashSet::new(),
            deferred: HashMap::new(),
            requests_rx: ReceiverStream::new(requests_rx),
            events,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        };
        (ctl, handle)
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(device = %self.device_id, "group controller has started");
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.tracker.next_deadline();
            let res = tokio::select! {
                msg_opt = self.requests_rx.next() => self.handle_ctl_msg(msg_opt).await,
                Some(event_res) = self.events.next() => self.handle_group_event(event_res).await,
                _ = sweep.tick() => self.handle_sweep().await,
                _ = expiry_timer(deadline) => self.handle_expiry(),
                _ = self.shutdown_rx.next() => break,
            };
            if let Err(err) = res {
                tracing::error!(error = ?err, "fatal error in group controller, shutting down");
                let _ = self.shutdown_tx.send(());
                break;
            }
        }

        tracing::debug!(
            device = %self.device_id,
            pending_groups = self.tracker.pending_group_count(),
            pending_objectives = self.tracker.pending_objective_count(),
            "group controller has shutdown"
        );
        Ok(())
    }

    /// Handle a group controller message.
    #[tracing::instrument(level = "trace", skip(self, msg_opt))]
    async fn handle_ctl_msg(&mut self, msg_opt: Option<GroupCtlMsg>) -> ShutdownResult<()> {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                let _ = self.shutdown_tx.send(());
                return Ok(());
            }
        };
        match msg {
            GroupCtlMsg::Install { plan, objective, tx } => self.handle_install(plan, objective, tx).await,
            GroupCtlMsg::AddBucket { plan, objective, tx } => self.handle_add_bucket(plan, objective, tx).await,
            GroupCtlMsg::RemoveBucket { objective, port, tx } => self.handle_remove_bucket(objective, port, tx).await,
            GroupCtlMsg::Remove { objective, tx } => self.handle_remove(objective, tx).await,
        }
    }

    /// Register a plan with the tracker and submit its innermost groups.
    #[tracing::instrument(level = "trace", skip(self, plan, objective, tx), fields(next_id = objective.id))]
    async fn handle_install(&mut self, plan: ChainPlan, objective: Arc<NextObjective>, tx: InstallReply) -> ShutdownResult<()> {
        let ChainPlan {
            initial,
            elements,
            next_group,
            top_key,
            top_id,
            ..
        } = plan;
        let pending = PendingNextGroup {
            objective,
            next_group,
            top_id,
            reply: Some(tx),
        };
        // Every registry is updated before the first group goes out.
        self.tracker.register_objective(top_key.clone(), pending, Instant::now());
        let mut queue = VecDeque::new();
        self.register_elements(elements, &top_key, &mut queue);
        queue.extend(initial.into_iter().map(Work::Create));
        self.drain(queue).await
    }

    /// Handle a request to add a bucket chain to a hashed objective.
    #[tracing::instrument(level = "trace", skip(self, plan, objective, tx), fields(next_id = objective.id))]
    async fn handle_add_bucket(&mut self, plan: ChainPlan, objective: Arc<NextObjective>, tx: InstallReply) -> ShutdownResult<()> {
        let existing = match self.store.get(objective.id).await {
            Ok(existing) => existing,
            Err(err) => {
                report(Some(tx), Err(ObjectiveError::Internal(err.to_string())));
                return Err(err);
            }
        };
        let existing = match existing {
            Some(existing) => existing,
            None if self.tracker.has_pending_objective(objective.id) => {
                if self.deferred.contains_key(&objective.id) {
                    let msg = format!("an add-bucket is already pending for next objective {}", objective.id);
                    report(Some(tx), Err(ObjectiveError::BadParams(msg)));
                } else {
                    tracing::debug!(next_id = objective.id, "deferring add-bucket until next objective is installed");
                    self.deferred.insert(objective.id, DeferredBucket { plan, objective, tx });
                }
                return Ok(());
            }
            None => {
                tracing::warn!(next_id = objective.id, "add-bucket for unknown next objective");
                report(Some(tx), Err(ObjectiveError::GroupMissing));
                return Ok(());
            }
        };
        let mut queue = VecDeque::new();
        self.apply_add_bucket(existing, DeferredBucket { plan, objective, tx }, &mut queue).await?;
        self.drain(queue).await
    }

    /// Merge a new bucket chain into an installed objective and queue its groups.
    async fn apply_add_bucket(&mut self, existing: NextGroup, request: DeferredBucket, queue: &mut VecDeque<Work>) -> ShutdownResult<()> {
        let DeferredBucket { plan, objective, tx } = request;
        let mut merged = existing;
        merged.chains.extend(plan.next_group.chains);
        if let Err(err) = self.store.put(&merged).await {
            report(Some(tx), Err(ObjectiveError::Internal(err.to_string())));
            return Err(err);
        }
        tracing::debug!(next_id = objective.id, group_id = %plan.top_id, chains = merged.chains.len(), "adding bucket chain to l3 ecmp group");
        self.register_elements(plan.elements, &plan.top_key, queue);
        queue.extend(plan.initial.into_iter().map(Work::Create));
        report(Some(tx), Ok(plan.top_id));
        Ok(())
    }

    /// Handle a request to remove a bucket from a hashed objective.
    ///
    /// Only the top-level bucket is removed; the groups of the removed chain are left alone, as
    /// other chains may still point to them.
    #[tracing::instrument(level = "trace", skip(self, objective, tx), fields(next_id = objective.id))]
    async fn handle_remove_bucket(&mut self, objective: Arc<NextObjective>, port: PortNumber, tx: InstallReply) -> ShutdownResult<()> {
        let existing = match self.store.get(objective.id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                tracing::warn!(next_id = objective.id, "remove-bucket for unknown next objective");
                report(Some(tx), Err(ObjectiveError::GroupMissing));
                return Ok(());
            }
            Err(err) => {
                report(Some(tx), Err(ObjectiveError::Internal(err.to_string())));
                return Err(err);
            }
        };

        let (index, pointed) = match self.find_chain_by_port(&existing, port) {
            Some(found) => found,
            None => {
                tracing::warn!(next_id = objective.id, %port, "could not find a group chain for removing bucket");
                report(Some(tx), Err(ObjectiveError::GroupMissing));
                return Ok(());
            }
        };

        let mut updated = existing;
        let chain = updated.chains.remove(index);
        let mod_key = match chain.first() {
            Some(key) => key.clone(),
            None => {
                report(Some(tx), Err(ObjectiveError::GroupMissing));
                return Ok(());
            }
        };
        let top_id = self
            .service
            .get_group(&self.device_id, &mod_key)
            .map(|group| group.id)
            .unwrap_or_else(|| ident::l3_ecmp_group_id(objective.id));
        tracing::debug!(next_id = objective.id, group_id = %top_id, removed_group_id = %pointed, "removing bucket from group");
        let bucket = GroupBucket::new(Treatment::new(vec![Instruction::Group(pointed)]));
        self.service.remove_buckets(&self.device_id, &mod_key, vec![bucket], &objective.app_id);

        if let Err(err) = self.store.put(&updated).await {
            report(Some(tx), Err(ObjectiveError::Internal(err.to_string())));
            return Err(err);
        }
        report(Some(tx), Ok(top_id));
        Ok(())
    }

    /// Find the chain whose terminal group outputs to the given port, returning its index and
    /// the id of the group its top-level bucket points to.
    fn find_chain_by_port(&self, next_group: &NextGroup, port: PortNumber) -> Option<(usize, GroupId)> {
        for (index, chain) in next_group.chains.iter().enumerate() {
            let terminal = chain.last().and_then(|key| self.service.get_group(&self.device_id, key));
            let terminal = match terminal {
                Some(terminal) => terminal,
                None => {
                    tracing::warn!(next_id = next_group.next_id, index, "inconsistent group chain");
                    continue;
                }
            };
            let out = terminal.buckets.first().and_then(|bucket| bucket.treatment.output_port());
            if out != Some(port) {
                continue;
            }
            let pointed = chain.get(1).and_then(|key| self.service.get_group(&self.device_id, key));
            match pointed {
                Some(pointed) => return Some((index, pointed.id)),
                None => {
                    tracing::warn!(next_id = next_group.next_id, index, "group pointed to by bucket not found");
                    return None;
                }
            }
        }
        None
    }

    /// Handle a request to remove every group of an objective.
    #[tracing::instrument(level = "trace", skip(self, objective, tx), fields(next_id = objective.id))]
    async fn handle_remove(&mut self, objective: Arc<NextObjective>, tx: oneshot::Sender<Result<(), ObjectiveError>>) -> ShutdownResult<()> {
        if let Some(deferred) = self.deferred.remove(&objective.id) {
            report(Some(deferred.tx), Err(ObjectiveError::GroupMissing));
        }
        let racing = self.tracker.take_objective(objective.id);
        if !racing.is_empty() {
            tracing::warn!(next_id = objective.id, "remove arrived before next objective was installed, failing the install");
            self.abandon(racing);
            self.update_gauges();
        }
        let existing = match self.store.get(objective.id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                tracing::warn!(next_id = objective.id, "remove for unknown next objective");
                report(Some(tx), Err(ObjectiveError::GroupMissing));
                return Ok(());
            }
            Err(err) => {
                report(Some(tx), Err(ObjectiveError::Internal(err.to_string())));
                return Err(err);
            }
        };
        for key in existing.distinct_keys() {
            tracing::debug!(next_id = objective.id, %key, "removing group");
            self.service.remove_group(&self.device_id, &key, &objective.app_id);
            self.requested.remove(&key);
        }
        if let Err(err) = self.store.remove(objective.id).await {
            report(Some(tx), Err(ObjectiveError::Internal(err.to_string())));
            return Err(err);
        }
        report(Some(tx), Ok(()));
        Ok(())
    }

    /// Handle an event from the group service.
    #[tracing::instrument(level = "trace", skip(self, event_res))]
    async fn handle_group_event(&mut self, event_res: Result<GroupEvent, BroadcastStreamRecvError>) -> ShutdownResult<()> {
        let event = match event_res {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(count)) => {
                tracing::warn!(count, "group event stream lagged, pending groups will be reconciled by the sweep");
                return Ok(());
            }
        };
        match event.kind {
            GroupEventKind::Added => {
                tracing::debug!(key = %event.key, "group added");
                self.drain(VecDeque::from(vec![Work::Resolve(event.key)])).await
            }
            GroupEventKind::Error => {
                // Still pending, a later confirmation resolves it normally.
                tracing::warn!(key = %event.key, device = %self.device_id, "group service reported an error for group");
                Ok(())
            }
            GroupEventKind::Removed => {
                tracing::debug!(key = %event.key, "group removed");
                self.requested.remove(&event.key);
                Ok(())
            }
        }
    }

    /// Resolve every pending key which the device already has.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_sweep(&mut self) -> ShutdownResult<()> {
        let (service, device_id) = (&self.service, &self.device_id);
        let found: VecDeque<Work> = self
            .tracker
            .pending_keys()
            .into_iter()
            .filter(|key| service.get_group(device_id, key).is_some())
            .map(Work::Resolve)
            .collect();
        if found.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = found.len(), "sweep found pending groups on device");
        self.drain(found).await
    }

    /// Fail every objective whose top-level group was not confirmed in time.
    #[tracing::instrument(level = "trace", skip(self))]
    fn handle_expiry(&mut self) -> ShutdownResult<()> {
        for (key, registrants) in self.tracker.expire(Instant::now()) {
            tracing::warn!(%key, count = registrants.len(), "pending next objectives expired");
            self.abandon(registrants);
        }
        self.update_gauges();
        Ok(())
    }

    /// Fail the given registrants and release the keys of their chains.
    ///
    /// A released key is no longer in CREATE_REQUESTED, so a later objective over the same key
    /// submits it again. Keys still awaited by another plan stay requested.
    fn abandon(&mut self, registrants: Vec<PendingNextGroup>) {
        for pending in registrants {
            let next_id = pending.objective.id;
            for key in pending.next_group.distinct_keys() {
                if !self.tracker.is_pending(&key) {
                    self.requested.remove(&key);
                }
            }
            self.emitter.failed(pending, ObjectiveError::GroupInstallationFailed);
            if let Some(deferred) = self.deferred.remove(&next_id) {
                report(Some(deferred.tx), Err(ObjectiveError::GroupInstallationFailed));
            }
        }
    }

    /// Register chain elements, queueing any which are ready right away.
    fn register_elements(&mut self, elements: Vec<GroupChainElem>, owner: &GroupKey, queue: &mut VecDeque<Work>) {
        for elem in elements {
            if let Some(ready) = self.tracker.register_elem(elem, owner) {
                queue.push_back(work_for(ready));
            }
        }
    }

    /// Process the work queue until it is empty.
    async fn drain(&mut self, mut queue: VecDeque<Work>) -> ShutdownResult<()> {
        while let Some(work) = queue.pop_front() {
            match work {
                Work::Create(descriptor) => self.submit_group(descriptor, &mut queue),
                Work::AddBuckets(descriptor) => {
                    tracing::debug!(key = %descriptor.key, group_id = %descriptor.id, "adding buckets to group");
                    self.service.add_buckets(&descriptor.device_id, &descriptor.key, descriptor.buckets, &descriptor.app_id);
                }
                Work::Resolve(key) => self.resolve(key, &mut queue).await?,
            }
        }
        self.update_gauges();
        Ok(())
    }

    /// Submit a group creation, unless it was already requested or already exists.
    fn submit_group(&mut self, descriptor: GroupDescriptor, queue: &mut VecDeque<Work>) {
        if self.requested.contains(&descriptor.key) {
            tracing::trace!(key = %descriptor.key, "group already requested");
            return;
        }
        if self.service.get_group(&self.device_id, &descriptor.key).is_some() {
            tracing::debug!(key = %descriptor.key, group_id = %descriptor.id, "group already on device, resolving");
            queue.push_back(Work::Resolve(descriptor.key));
            return;
        }
        tracing::debug!(key = %descriptor.key, group_id = %descriptor.id, device = %self.device_id, "submitting group");
        self.requested.insert(descriptor.key.clone());
        metrics::increment_counter!(METRIC_GROUPS_SUBMITTED);
        self.service.add_group(descriptor);
    }

    /// Resolve a confirmed key, advancing chains or completing objectives.
    async fn resolve(&mut self, key: GroupKey, queue: &mut VecDeque<Work>) -> ShutdownResult<()> {
        self.requested.remove(&key);
        match self.tracker.resolve(&key) {
            Resolution::Advance(ready) => {
                tracing::debug!(%key, ready = ready.len(), "processing next groups in group chain");
                queue.extend(ready.into_iter().map(work_for));
            }
            Resolution::Complete(registrants) => {
                for pending in registrants {
                    self.complete_objective(&key, pending, queue).await?;
                }
            }
            Resolution::Noop => tracing::trace!(%key, "nothing pending on group"),
        }
        Ok(())
    }

    /// Report an objective as installed, then apply any add-bucket deferred on it.
    async fn complete_objective(&mut self, key: &GroupKey, pending: PendingNextGroup, queue: &mut VecDeque<Work>) -> ShutdownResult<()> {
        let group_id = self.service.get_group(&self.device_id, key).map(|group| group.id).unwrap_or(pending.top_id);
        let next_id = pending.objective.id;
        let next_group = self.emitter.installed(pending, group_id).await?;
        if let Some(deferred) = self.deferred.remove(&next_id) {
            self.apply_add_bucket(next_group, deferred, queue).await?;
        }
        Ok(())
    }

    fn update_gauges(&self) {
        metrics::gauge!(METRIC_PENDING_GROUPS, self.tracker.pending_group_count() as f64);
        metrics::gauge!(METRIC_PENDING_OBJECTIVES, self.tracker.pending_objective_count() as f64);
    }
}

/// The work needed to act on a ready chain element.
fn work_for(elem: GroupChainElem) -> Work {
    if elem.add_bucket {
        Work::AddBuckets(elem.descriptor)
    } else {
        Work::Create(elem.descriptor)
    }
}

/// Resolves at the given deadline, or never without one.
async fn expiry_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
