//! Replay of next objectives from a JSON file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::ctl::GroupHandle;
use crate::error::ObjectiveError;
use crate::models::{NextObjective, NextType};

/// The operation applied to a replayed objective.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOp {
    #[default]
    Add,
    AddBucket,
    RemoveBucket,
    Remove,
}

/// A single parsed entry of a replay file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayEntry {
    pub op: ReplayOp,
    pub objective: NextObjective,
}

/// Parse the entries of a replay file, which must hold a JSON array.
///
/// Each entry is parsed on its own, so that one bad entry does not spoil the rest.
pub fn parse_entries(data: &[u8]) -> Result<Vec<Result<ReplayEntry, ObjectiveError>>> {
    let values: Value = serde_json::from_slice(data).context("error parsing objectives file as JSON")?;
    let values = match values {
        Value::Array(values) => values,
        _ => bail!("objectives file must hold a JSON array"),
    };
    Ok(values.into_iter().map(parse_entry).collect())
}

fn parse_entry(mut value: Value) -> Result<ReplayEntry, ObjectiveError> {
    match value.get("type") {
        Some(Value::String(kind)) => {
            NextType::try_from(kind.as_str())?;
        }
        // Numeric type codes are accepted and rewritten to their names.
        Some(Value::Number(code)) => {
            let kind = code
                .as_u64()
                .and_then(|code| u8::try_from(code).ok())
                .ok_or_else(|| ObjectiveError::Unknown(format!("type code {}", code)))
                .and_then(NextType::try_from)?;
            value["type"] = Value::String(kind.as_str().into());
        }
        _ => (),
    }
    let op = match value.as_object_mut().and_then(|obj| obj.remove("op")) {
        Some(op) => serde_json::from_value(op).map_err(|err| ObjectiveError::BadParams(format!("bad op: {}", err)))?,
        None => ReplayOp::default(),
    };
    let objective = serde_json::from_value(value).map_err(|err| ObjectiveError::BadParams(err.to_string()))?;
    Ok(ReplayEntry { op, objective })
}

/// Read the given replay file and spawn a task applying its entries in order.
pub async fn spawn_replay(path: &Path, handle: GroupHandle, mut shutdown: broadcast::Receiver<()>) -> Result<JoinHandle<Result<()>>> {
    let data = tokio::fs::read(path).await.with_context(|| format!("error reading objectives file {}", path.display()))?;
    let entries = parse_entries(&data)?;
    tracing::info!(path = %path.display(), count = entries.len(), "replaying next objectives");
    Ok(tokio::spawn(async move {
        tokio::select! {
            res = apply_entries(entries, handle) => res,
            _ = shutdown.recv() => Ok(()),
        }
    }))
}

async fn apply_entries(entries: Vec<Result<ReplayEntry, ObjectiveError>>, handle: GroupHandle) -> Result<()> {
    for (index, entry) in entries.into_iter().enumerate() {
        let ReplayEntry { op, objective } = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(index, error = %err, "skipping bad objectives file entry");
                continue;
            }
        };
        let next_id = objective.id;
        let outcome = match op {
            ReplayOp::Add => handle.submit(objective).await?.await.map(|res| res.map(Some)),
            ReplayOp::AddBucket => handle.add_bucket(objective).await?.await.map(|res| res.map(Some)),
            ReplayOp::RemoveBucket => handle.remove_bucket(objective).await?.await.map(|res| res.map(Some)),
            ReplayOp::Remove => handle.remove(objective).await?.await.map(|res| res.map(|_| None)),
        };
        match outcome {
            Ok(Ok(Some(group_id))) => tracing::info!(next_id, ?op, %group_id, "replayed next objective"),
            Ok(Ok(None)) => tracing::info!(next_id, ?op, "replayed next objective"),
            Ok(Err(err)) => tracing::warn!(next_id, ?op, error = %err, "replayed next objective failed"),
            Err(_) => bail!("group controller dropped the outcome of next objective {}", next_id),
        }
    }
    Ok(())
}
