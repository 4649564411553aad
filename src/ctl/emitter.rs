use tokio::sync::oneshot;

use crate::ctl::{METRIC_OBJECTIVES_FAILED, METRIC_OBJECTIVES_INSTALLED};
use crate::error::{ObjectiveError, ObjectiveResult, ShutdownResult};
use crate::models::{GroupId, NextGroup};
use crate::pending::PendingNextGroup;
use crate::store::NextGroupStore;

/// Reports the outcome of next objectives to their originators.
pub struct ResultEmitter {
    store: NextGroupStore,
}

impl ResultEmitter {
    /// Create a new instance.
    pub fn new(store: NextGroupStore) -> Self {
        Self { store }
    }

    /// Persist the chain representation of an installed objective, then report its success.
    ///
    /// Nothing is reported as a success unless it was persisted first.
    #[tracing::instrument(level = "trace", skip(self, pending), fields(next_id = pending.objective.id))]
    pub async fn installed(&self, pending: PendingNextGroup, group_id: GroupId) -> ShutdownResult<NextGroup> {
        let PendingNextGroup { objective, next_group, reply, .. } = pending;
        if let Err(err) = self.store.put(&next_group).await {
            tracing::error!(error = ?err, next_id = objective.id, "error persisting next group record");
            metrics::increment_counter!(METRIC_OBJECTIVES_FAILED);
            report(reply, Err(ObjectiveError::Internal(err.to_string())));
            return Err(err);
        }
        tracing::info!(next_id = objective.id, group_id = %group_id, chains = next_group.chains.len(), "done implementing next objective");
        metrics::increment_counter!(METRIC_OBJECTIVES_INSTALLED);
        report(reply, Ok(group_id));
        Ok(next_group)
    }

    /// Report the failure of an objective. Nothing is persisted.
    pub fn failed(&self, pending: PendingNextGroup, err: ObjectiveError) {
        tracing::warn!(next_id = pending.objective.id, error = %err, "next objective failed");
        metrics::increment_counter!(METRIC_OBJECTIVES_FAILED);
        report(pending.reply, Err(err));
    }
}

/// Send an outcome to an originator, if it is still listening.
pub(crate) fn report<T>(reply: Option<oneshot::Sender<T>>, outcome: T) {
    if let Some(tx) = reply {
        if tx.send(outcome).is_err() {
            tracing::debug!("originator dropped its outcome channel");
        }
    }
}

/// The outcome type reported for objective installs.
pub(crate) type InstallReply = oneshot::Sender<ObjectiveResult>;
