use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};

use crate::chain::{ChainBuilder, ChainError};
use crate::ctl::{GroupCtlMsg, METRIC_OBJECTIVES_FAILED};
use crate::error::{ObjectiveError, ObjectiveResult};
use crate::models::NextObjective;

/// A handle to a group controller.
///
/// Group chains are built on the caller's task. Every operation returns a channel which
/// receives the outcome once the controller has one, and never waits on the device.
#[derive(Clone)]
pub struct GroupHandle {
    builder: ChainBuilder,
    tx: mpsc::Sender<GroupCtlMsg>,
}

impl GroupHandle {
    pub(super) fn new(builder: ChainBuilder, tx: mpsc::Sender<GroupCtlMsg>) -> Self {
        Self { builder, tx }
    }

    /// Submit a next objective for installation.
    pub async fn submit(&self, objective: NextObjective) -> Result<oneshot::Receiver<ObjectiveResult>> {
        let (tx, rx) = oneshot::channel();
        let plan = match self.builder.build(&objective) {
            Ok(plan) => plan,
            Err(err) => return Ok(reject(tx, rx, &objective, err)),
        };
        tracing::debug!(next_id = objective.id, kind = %objective.kind, groups = plan.descriptors().count(), "submitting next objective");
        self.send(GroupCtlMsg::Install {
            plan,
            objective: Arc::new(objective),
            tx,
        })
        .await?;
        Ok(rx)
    }

    /// Add the single bucket of the given objective to its installed hashed group chain.
    ///
    /// Resolves with the id of the top-level group once the chain representation is updated.
    pub async fn add_bucket(&self, objective: NextObjective) -> Result<oneshot::Receiver<ObjectiveResult>> {
        let (tx, rx) = oneshot::channel();
        let plan = match self.builder.build_add_bucket(&objective) {
            Ok(plan) => plan,
            Err(err) => return Ok(reject(tx, rx, &objective, err)),
        };
        self.send(GroupCtlMsg::AddBucket {
            plan,
            objective: Arc::new(objective),
            tx,
        })
        .await?;
        Ok(rx)
    }

    /// Remove the bucket which outputs to the port of the given objective's bucket.
    pub async fn remove_bucket(&self, objective: NextObjective) -> Result<oneshot::Receiver<ObjectiveResult>> {
        let (tx, rx) = oneshot::channel();
        let port = match self.builder.removal_port(&objective) {
            Ok(port) => port,
            Err(err) => return Ok(reject(tx, rx, &objective, err)),
        };
        self.send(GroupCtlMsg::RemoveBucket {
            objective: Arc::new(objective),
            port,
            tx,
        })
        .await?;
        Ok(rx)
    }

    /// Remove every group of the given objective along with its stored record.
    pub async fn remove(&self, objective: NextObjective) -> Result<oneshot::Receiver<Result<(), ObjectiveError>>> {
        let (tx, rx) = oneshot::channel();
        self.send(GroupCtlMsg::Remove {
            objective: Arc::new(objective),
            tx,
        })
        .await?;
        Ok(rx)
    }

    async fn send(&self, msg: GroupCtlMsg) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| anyhow!("group controller is no longer running"))
    }
}

/// Report a builder failure before anything reaches the controller.
fn reject(
    tx: oneshot::Sender<ObjectiveResult>, rx: oneshot::Receiver<ObjectiveResult>, objective: &NextObjective, err: ChainError,
) -> oneshot::Receiver<ObjectiveResult> {
    tracing::warn!(next_id = objective.id, kind = %objective.kind, error = %err, "could not build group chain");
    metrics::increment_counter!(METRIC_OBJECTIVES_FAILED);
    let _ = tx.send(Err(err.into()));
    rx
}
