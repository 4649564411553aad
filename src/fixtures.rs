use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::prelude::*;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::ctl::{GroupCtl, GroupHandle};
use crate::database::Database;
use crate::models::{ApplicationId, Criterion, DeviceId, Instruction, MacAddress, MplsLabel, NextObjective, NextType, PortNumber, Selector, Treatment, VlanId};
use crate::service::MemoryGroupService;
use crate::store::NextGroupStore;

/// The device used throughout tests.
pub const DEVICE: &str = "of:0000000000000001";

pub fn device() -> DeviceId {
    DeviceId::new(DEVICE)
}

pub fn app() -> ApplicationId {
    ApplicationId("org.groupchain.test".into())
}

pub fn mac(last: u8) -> MacAddress {
    MacAddress([0x00, 0x00, 0x5e, 0x00, 0x53, last])
}

/// A bucket which only outputs to the given port.
pub fn output(port: u64) -> Treatment {
    Treatment::new(vec![Instruction::Output(PortNumber(port))])
}

/// A bucket which rewrites MACs and the VLAN before output.
pub fn routed(port: u64) -> Treatment {
    Treatment::new(vec![
        Instruction::SetEthSrc(mac(1)),
        Instruction::SetEthDst(mac(port as u8)),
        Instruction::SetVlanId(VlanId(10)),
        Instruction::Output(PortNumber(port)),
    ])
}

/// A routed bucket which additionally pushes one MPLS label.
pub fn labeled(port: u64, label: u32) -> Treatment {
    Treatment::new(vec![
        Instruction::PushMpls,
        Instruction::SetMplsLabel(MplsLabel(label)),
        Instruction::SetEthSrc(mac(1)),
        Instruction::SetEthDst(mac(port as u8)),
        Instruction::SetVlanId(VlanId(10)),
        Instruction::Output(PortNumber(port)),
    ])
}

pub fn objective(id: u32, kind: NextType, treatments: Vec<Treatment>, vlan: Option<u16>) -> NextObjective {
    NextObjective {
        id,
        kind,
        treatments,
        app_id: app(),
        meta: vlan.map(|vlan| Selector::new(vec![Criterion::VlanVid(VlanId(vlan))])),
    }
}

/// A random number of buckets for multi-bucket objectives.
pub fn random_bucket_count() -> usize {
    rand::thread_rng().gen_range(2..6)
}

/// Poll the given condition until it holds, returning false if it never did within the timeout.
pub async fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A running group controller backed by a manual in-memory switch.
pub struct Harness {
    pub service: Arc<MemoryGroupService>,
    pub store: NextGroupStore,
    pub handle: GroupHandle,
    shutdown_tx: broadcast::Sender<()>,
    ctl: JoinHandle<Result<()>>,
    _tmpdir: TempDir,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        let (config, tmpdir) = Config::new_test()?;
        Self::with_config(config, tmpdir).await
    }

    /// Create a harness whose pending objectives expire after the given delay.
    pub async fn with_expiry(expiry: Duration) -> Result<Self> {
        let (config, tmpdir) = Config::new_test()?;
        let mut config = (*config).clone();
        config.pending_expiry_millis = expiry.as_millis() as u64;
        Self::with_config(Arc::new(config), tmpdir).await
    }

    async fn with_config(config: Arc<Config>, tmpdir: TempDir) -> Result<Self> {
        let db = Database::new(config.clone()).await?;
        let store = NextGroupStore::new(&db).await?;
        let service = Arc::new(MemoryGroupService::manual());
        let (shutdown_tx, _) = broadcast::channel(1);
        let (ctl, handle) = GroupCtl::new(config, store.clone(), service.clone(), shutdown_tx.clone());
        let ctl = ctl.spawn();
        Ok(Self {
            service,
            store,
            handle,
            shutdown_tx,
            ctl,
            _tmpdir: tmpdir,
        })
    }

    /// Wait until the switch has seen the given number of operations.
    pub async fn wait_for_ops(&self, count: usize) -> bool {
        let service = self.service.clone();
        wait_for(Duration::from_secs(2), move || service.ops().len() >= count).await
    }

    /// Confirm every group currently awaiting confirmation, returning how many were confirmed.
    pub fn confirm_requested(&self) -> usize {
        self.service.requested_keys().into_iter().filter(|key| self.service.confirm(key)).count()
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.ctl.await.context("error joining group controller")??;
        Ok(())
    }
}
