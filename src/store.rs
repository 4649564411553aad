//! Storage of installed next objective records.

use anyhow::{Context, Result};

use crate::database::{Database, Tree};
use crate::error::{ShutdownError, ShutdownResult, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::models::NextGroup;
use crate::utils;

/// The store of chain representations, keyed by next objective id.
#[derive(Clone)]
pub struct NextGroupStore {
    tree: Tree,
}

impl NextGroupStore {
    /// Create a new instance.
    pub async fn new(db: &Database) -> ShutdownResult<Self> {
        let tree = db.get_next_groups_tree().await?;
        Ok(Self { tree })
    }

    /// Get the record of the given next objective.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn get(&self, next_id: u32) -> ShutdownResult<Option<NextGroup>> {
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<Option<NextGroup>> {
            let val = tree.get(utils::encode_u32(next_id)).context("error fetching next group record")?;
            val.map(|val| NextGroup::decode(&val)).transpose()
        })
        .await
        .and_then(|res| res.map_err(ShutdownError::from))
    }

    /// Write the given record, overwriting any previous record of the same next objective.
    #[tracing::instrument(level = "trace", skip(self, next_group), fields(next_id = next_group.next_id))]
    pub async fn put(&self, next_group: &NextGroup) -> ShutdownResult<()> {
        let (key, val) = (utils::encode_u32(next_group.next_id), next_group.encode().map_err(ShutdownError::from)?);
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<()> {
            tree.insert(key, val).context("error writing next group record")?;
            Ok(())
        })
        .await
        .and_then(|res| res.map_err(ShutdownError::from))?;
        self.tree.flush_async().await.context(ERR_DB_FLUSH).map_err(ShutdownError::from)?;
        Ok(())
    }

    /// Remove the record of the given next objective, returning it if it existed.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn remove(&self, next_id: u32) -> ShutdownResult<Option<NextGroup>> {
        let tree = self.tree.clone();
        let removed = Database::spawn_blocking(move || -> Result<Option<NextGroup>> {
            let val = tree.remove(utils::encode_u32(next_id)).context("error removing next group record")?;
            val.map(|val| NextGroup::decode(&val)).transpose()
        })
        .await
        .and_then(|res| res.map_err(ShutdownError::from))?;
        self.tree.flush_async().await.context(ERR_DB_FLUSH).map_err(ShutdownError::from)?;
        Ok(removed)
    }

    /// List every stored record, ordered by next objective id.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn list(&self) -> ShutdownResult<Vec<NextGroup>> {
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<Vec<NextGroup>> {
            let mut records = vec![];
            for kv_res in tree.iter() {
                let (_, val) = kv_res.context(ERR_ITER_FAILURE)?;
                records.push(NextGroup::decode(&val)?);
            }
            Ok(records)
        })
        .await
        .and_then(|res| res.map_err(ShutdownError::from))
    }
}
