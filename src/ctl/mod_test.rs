use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::error::{ObjectiveError, ObjectiveResult};
use crate::fixtures::{self, Harness};
use crate::ident;
use crate::models::{GroupBucket, GroupEvent, GroupEventKind, GroupId, GroupType, Instruction, NextType, Treatment, VlanId};
use crate::service::{GroupOp, GroupService};

const TIMEOUT: Duration = Duration::from_secs(2);

/// Await an outcome, failing if it does not arrive in time.
async fn outcome<T>(rx: oneshot::Receiver<T>) -> Result<T> {
    tokio::time::timeout(TIMEOUT, rx)
        .await
        .context("timeout awaiting outcome")?
        .context("outcome channel closed")
}

/// Confirm requested groups as they appear until the outcome arrives.
async fn drive(harness: &Harness, mut rx: oneshot::Receiver<ObjectiveResult>) -> Result<ObjectiveResult> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        match rx.try_recv() {
            Ok(res) => return Ok(res),
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Closed) => bail!("outcome channel closed"),
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timeout driving objective to completion");
        }
        harness.confirm_requested();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn added_groups(harness: &Harness) -> Vec<crate::models::GroupDescriptor> {
    harness
        .service
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            GroupOp::AddGroup(group) => Some(group),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn plain_l2_objective_installs_and_persists() -> Result<()> {
    let harness = Harness::new().await?;
    let rx = harness.handle.submit(fixtures::objective(1, NextType::Simple, vec![fixtures::output(5)], Some(100))).await?;

    assert!(harness.wait_for_ops(1).await, "expected the l2 interface group to be submitted");
    let res = drive(&harness, rx).await?;

    assert_eq!(res, Ok(GroupId(0x0064_0005)), "expected group id 0x00640005 got {:?}", res);
    let record = harness.store.get(1).await?.context("expected a stored record")?;
    assert_eq!(record.chains.len(), 1, "expected 1 chain got {:?}", record.chains);

    harness.shutdown().await
}

#[tokio::test]
async fn outer_group_is_submitted_only_after_inner_is_confirmed() -> Result<()> {
    let harness = Harness::new().await?;
    let mut rx = harness.handle.submit(fixtures::objective(2, NextType::Simple, vec![fixtures::routed(7)], None)).await?;

    assert!(harness.wait_for_ops(1).await, "expected the inner group to be submitted");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let added = added_groups(&harness);
    assert_eq!(added.len(), 1, "expected only the inner group before confirmation, got {:?}", added);
    assert_eq!(added[0].id, GroupId(0x000a_0007), "expected inner l2 group first got {}", added[0].id);

    assert_eq!(harness.confirm_requested(), 1, "expected to confirm the inner group");
    assert!(harness.wait_for_ops(2).await, "expected the outer group to be submitted");
    let added = added_groups(&harness);
    assert_eq!(added[1].id.0 >> 28, 0x2, "expected the l3 unicast group second got {}", added[1].id);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)), "expected no outcome before the outer group is confirmed");

    assert_eq!(harness.confirm_requested(), 1, "expected to confirm the outer group");
    let res = outcome(rx).await?;
    assert_eq!(res, Ok(added[1].id), "expected the outer group id got {:?}", res);

    harness.shutdown().await
}

#[tokio::test]
async fn flood_group_waits_for_every_interface_group() -> Result<()> {
    let harness = Harness::new().await?;
    let count = fixtures::random_bucket_count();
    let treatments = (1..=count as u64).map(fixtures::output).collect();
    let rx = harness.handle.submit(fixtures::objective(3, NextType::Broadcast, treatments, Some(100))).await?;

    assert!(harness.wait_for_ops(count).await, "expected {} interface groups to be submitted", count);
    let mut keys = harness.service.requested_keys();
    keys.sort();
    let last = keys.pop().context("expected requested keys")?;
    for key in keys.iter() {
        assert!(harness.service.confirm(key), "expected to confirm {}", key);
    }
    // Duplicate confirmations must not count twice.
    for _ in 0..2 {
        harness.service.emit(GroupEvent {
            kind: GroupEventKind::Added,
            key: keys[0].clone(),
        });
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.service.ops().len(), count, "expected no flood group before every interface group is confirmed");

    assert!(harness.service.confirm(&last), "expected to confirm {}", last);
    assert!(harness.wait_for_ops(count + 1).await, "expected the flood group to be submitted");
    let flood = added_groups(&harness).pop().context("expected a flood group")?;
    assert_eq!(flood.kind, GroupType::All, "expected an all group got {:?}", flood.kind);
    assert_eq!(flood.buckets.len(), count, "expected {} buckets got {}", count, flood.buckets.len());

    let res = drive(&harness, rx).await?;
    let expected = ident::l2_flood_group_id(VlanId(100), 3);
    assert_eq!(res, Ok(expected), "expected {} got {:?}", expected, res);
    let record = harness.store.get(3).await?.context("expected a stored record")?;
    assert_eq!(record.chains.len(), count, "expected {} chains got {}", count, record.chains.len());

    harness.shutdown().await
}

#[tokio::test]
async fn hashed_objective_installs_bottom_up() -> Result<()> {
    let harness = Harness::new().await?;
    let treatments = vec![fixtures::routed(1), fixtures::routed(2), fixtures::labeled(3, 100)];
    let rx = harness.handle.submit(fixtures::objective(4, NextType::Hashed, treatments, None)).await?;

    let res = drive(&harness, rx).await?;

    let expected = ident::l3_ecmp_group_id(4);
    assert_eq!(res, Ok(expected), "expected {} got {:?}", expected, res);
    let added = added_groups(&harness);
    assert_eq!(added.len(), 8, "expected 8 submitted groups got {}", added.len());
    assert_eq!(added[7].kind, GroupType::Select, "expected the ecmp group last got {:?}", added[7].kind);
    let record = harness.store.get(4).await?.context("expected a stored record")?;
    let lens: Vec<usize> = record.chains.iter().map(Vec::len).collect();
    assert_eq!(lens, vec![3, 3, 4], "expected chain lengths [3, 3, 4] got {:?}", lens);

    harness.shutdown().await
}

#[tokio::test]
async fn unconfirmed_objective_expires() -> Result<()> {
    let harness = Harness::with_expiry(Duration::from_millis(200)).await?;
    let rx = harness.handle.submit(fixtures::objective(5, NextType::Simple, vec![fixtures::output(5)], Some(100))).await?;

    let res = outcome(rx).await?;

    assert_eq!(res, Err(ObjectiveError::GroupInstallationFailed), "expected installation failure got {:?}", res);
    let record = harness.store.get(5).await?;
    assert!(record.is_none(), "expected no stored record got {:?}", record);

    harness.shutdown().await
}

#[tokio::test]
async fn sweep_recovers_lost_confirmations() -> Result<()> {
    let harness = Harness::new().await?;
    let rx = harness.handle.submit(fixtures::objective(6, NextType::Simple, vec![fixtures::output(5)], Some(100))).await?;

    assert!(harness.wait_for_ops(1).await, "expected the group to be submitted");
    for key in harness.service.requested_keys() {
        assert!(harness.service.install_silently(&key), "expected to install {}", key);
    }
    let res = outcome(rx).await?;

    assert_eq!(res, Ok(GroupId(0x0064_0005)), "expected group id 0x00640005 got {:?}", res);

    harness.shutdown().await
}

#[tokio::test]
async fn builder_failures_never_reach_the_device() -> Result<()> {
    let harness = Harness::new().await?;

    let failover = harness.handle.submit(fixtures::objective(7, NextType::Failover, vec![fixtures::output(1)], Some(10))).await?;
    let no_vlan = harness.handle.submit(fixtures::objective(8, NextType::Simple, vec![fixtures::output(1)], None)).await?;

    let res = outcome(failover).await?;
    assert!(matches!(res, Err(ObjectiveError::Unsupported(_))), "expected unsupported got {:?}", res);
    let res = outcome(no_vlan).await?;
    assert!(matches!(res, Err(ObjectiveError::BadParams(_))), "expected bad params got {:?}", res);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.service.ops().is_empty(), "expected no device operations got {:?}", harness.service.ops());

    harness.shutdown().await
}

#[tokio::test]
async fn shared_groups_are_submitted_once() -> Result<()> {
    let harness = Harness::new().await?;
    let routed = harness.handle.submit(fixtures::objective(9, NextType::Simple, vec![fixtures::routed(7)], None)).await?;
    let mut plain = harness.handle.submit(fixtures::objective(10, NextType::Simple, vec![fixtures::output(7)], Some(10))).await?;

    assert!(harness.wait_for_ops(1).await, "expected the shared group to be submitted");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(added_groups(&harness).len(), 1, "expected a single submission before confirmation");
    assert!(matches!(plain.try_recv(), Err(TryRecvError::Empty)), "expected no outcome before any confirmation");

    let res = drive(&harness, routed).await?;
    assert!(res.is_ok(), "expected routed objective to install got {:?}", res);
    let res = outcome(plain).await?;
    assert_eq!(res, Ok(GroupId(0x000a_0007)), "expected group id 0x000a0007 got {:?}", res);
    let shared: Vec<_> = added_groups(&harness).into_iter().filter(|group| group.id == GroupId(0x000a_0007)).collect();
    assert_eq!(shared.len(), 1, "expected the shared group to be submitted once got {}", shared.len());

    harness.shutdown().await
}

#[tokio::test]
async fn late_registrant_on_installed_group_completes_without_submission() -> Result<()> {
    let harness = Harness::new().await?;
    let rx = harness.handle.submit(fixtures::objective(11, NextType::Simple, vec![fixtures::output(5)], Some(100))).await?;
    let res = drive(&harness, rx).await?;
    assert!(res.is_ok(), "expected first objective to install got {:?}", res);

    let rx = harness.handle.submit(fixtures::objective(12, NextType::Simple, vec![fixtures::output(5)], Some(100))).await?;
    let res = outcome(rx).await?;

    assert_eq!(res, Ok(GroupId(0x0064_0005)), "expected group id 0x00640005 got {:?}", res);
    let added = added_groups(&harness);
    assert_eq!(added.len(), 1, "expected a single group submission got {}", added.len());
    assert!(harness.store.get(12).await?.is_some(), "expected a stored record for the late registrant");

    harness.shutdown().await
}

#[tokio::test]
async fn error_event_keeps_group_pending() -> Result<()> {
    let harness = Harness::new().await?;
    let mut rx = harness.handle.submit(fixtures::objective(13, NextType::Simple, vec![fixtures::output(5)], Some(100))).await?;

    assert!(harness.wait_for_ops(1).await, "expected the group to be submitted");
    let key = harness.service.requested_keys().pop().context("expected a requested key")?;
    harness.service.emit(GroupEvent {
        kind: GroupEventKind::Error,
        key: key.clone(),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)), "expected no outcome after an error event");

    assert!(harness.service.confirm(&key), "expected to confirm {}", key);
    let res = outcome(rx).await?;
    assert_eq!(res, Ok(GroupId(0x0064_0005)), "expected group id 0x00640005 got {:?}", res);

    harness.shutdown().await
}

#[tokio::test]
async fn add_bucket_extends_installed_ecmp_group() -> Result<()> {
    let harness = Harness::new().await?;
    let rx = harness
        .handle
        .submit(fixtures::objective(14, NextType::Hashed, vec![fixtures::routed(1), fixtures::routed(2)], None))
        .await?;
    let res = drive(&harness, rx).await?;
    assert!(res.is_ok(), "expected hashed objective to install got {:?}", res);

    let rx = harness.handle.add_bucket(fixtures::objective(14, NextType::Hashed, vec![fixtures::routed(3)], None)).await?;
    let res = outcome(rx).await?;
    let expected = ident::l3_ecmp_group_id(14);
    assert_eq!(res, Ok(expected), "expected {} got {:?}", expected, res);

    let (service, ecmp_key) = (harness.service.clone(), ident::l3_ecmp_group_key(14));
    let added_bucket = fixtures::wait_for(TIMEOUT, move || {
        for key in service.requested_keys() {
            service.confirm(&key);
        }
        service.ops().iter().any(|op| matches!(op, GroupOp::AddBuckets { key, .. } if key == &ecmp_key))
    })
    .await;
    assert!(added_bucket, "expected a bucket to be added to the ecmp group");
    let ecmp = harness.service.get_group(&fixtures::device(), &ident::l3_ecmp_group_key(14)).context("expected the ecmp group")?;
    assert_eq!(ecmp.buckets.len(), 3, "expected 3 ecmp buckets got {}", ecmp.buckets.len());
    let record = harness.store.get(14).await?.context("expected a stored record")?;
    assert_eq!(record.chains.len(), 3, "expected 3 chains got {}", record.chains.len());

    harness.shutdown().await
}

#[tokio::test]
async fn add_bucket_is_deferred_until_objective_installs() -> Result<()> {
    let harness = Harness::new().await?;
    let rx = harness
        .handle
        .submit(fixtures::objective(15, NextType::Hashed, vec![fixtures::routed(1), fixtures::routed(2)], None))
        .await?;
    let deferred = harness.handle.add_bucket(fixtures::objective(15, NextType::Hashed, vec![fixtures::routed(3)], None)).await?;
    let second = harness.handle.add_bucket(fixtures::objective(15, NextType::Hashed, vec![fixtures::routed(4)], None)).await?;

    let res = outcome(second).await?;
    assert!(matches!(res, Err(ObjectiveError::BadParams(_))), "expected bad params for a second deferral got {:?}", res);

    let res = drive(&harness, rx).await?;
    assert!(res.is_ok(), "expected hashed objective to install got {:?}", res);
    let res = outcome(deferred).await?;
    let expected = ident::l3_ecmp_group_id(15);
    assert_eq!(res, Ok(expected), "expected {} got {:?}", expected, res);
    let record = harness.store.get(15).await?.context("expected a stored record")?;
    assert_eq!(record.chains.len(), 3, "expected 3 chains got {}", record.chains.len());

    harness.shutdown().await
}

#[tokio::test]
async fn add_bucket_for_unknown_objective_is_missing() -> Result<()> {
    let harness = Harness::new().await?;
    let rx = harness.handle.add_bucket(fixtures::objective(16, NextType::Hashed, vec![fixtures::routed(3)], None)).await?;

    let res = outcome(rx).await?;

    assert_eq!(res, Err(ObjectiveError::GroupMissing), "expected group missing got {:?}", res);
    harness.shutdown().await
}

#[tokio::test]
async fn remove_bucket_detaches_matching_chain() -> Result<()> {
    let harness = Harness::new().await?;
    let treatments = vec![fixtures::routed(1), fixtures::routed(2), fixtures::routed(3)];
    let rx = harness.handle.submit(fixtures::objective(17, NextType::Hashed, treatments, None)).await?;
    let res = drive(&harness, rx).await?;
    assert!(res.is_ok(), "expected hashed objective to install got {:?}", res);

    let record = harness.store.get(17).await?.context("expected a stored record")?;
    let removed = record.chains[1].clone();
    let pointed = harness.service.get_group(&fixtures::device(), &removed[1]).context("expected the pointed group")?;

    let rx = harness.handle.remove_bucket(fixtures::objective(17, NextType::Hashed, vec![fixtures::output(2)], None)).await?;
    let res = outcome(rx).await?;

    let expected = ident::l3_ecmp_group_id(17);
    assert_eq!(res, Ok(expected), "expected {} got {:?}", expected, res);
    let removals: Vec<_> = harness.service.ops().into_iter().filter(|op| matches!(op, GroupOp::RemoveBuckets { .. })).collect();
    let expected_op = GroupOp::RemoveBuckets {
        key: ident::l3_ecmp_group_key(17),
        buckets: vec![GroupBucket::new(Treatment::new(vec![Instruction::Group(pointed.id)]))],
    };
    assert_eq!(removals, vec![expected_op], "unexpected bucket removals {:?}", removals);
    let record = harness.store.get(17).await?.context("expected a stored record")?;
    assert_eq!(record.chains.len(), 2, "expected 2 chains got {}", record.chains.len());
    assert!(!record.chains.contains(&removed), "expected the removed chain to be gone got {:?}", record.chains);

    harness.shutdown().await
}

#[tokio::test]
async fn remove_deletes_every_group_once() -> Result<()> {
    let harness = Harness::new().await?;
    let obj = fixtures::objective(18, NextType::Simple, vec![fixtures::routed(7)], None);
    let rx = harness.handle.submit(obj.clone()).await?;
    let res = drive(&harness, rx).await?;
    assert!(res.is_ok(), "expected objective to install got {:?}", res);

    let res = outcome(harness.handle.remove(obj.clone()).await?).await?;
    assert_eq!(res, Ok(()), "expected removal to succeed got {:?}", res);

    let removals = harness.service.ops().into_iter().filter(|op| matches!(op, GroupOp::RemoveGroup(_))).count();
    assert_eq!(removals, 2, "expected 2 group removals got {}", removals);
    assert!(harness.store.get(18).await?.is_none(), "expected the record to be removed");
    let res = outcome(harness.handle.remove(obj).await?).await?;
    assert_eq!(res, Err(ObjectiveError::GroupMissing), "expected group missing got {:?}", res);

    harness.shutdown().await
}

#[tokio::test]
async fn rejected_inner_group_is_submitted_again_after_expiry() -> Result<()> {
    let harness = Harness::with_expiry(Duration::from_millis(200)).await?;
    let rx = harness.handle.submit(fixtures::objective(30, NextType::Simple, vec![fixtures::routed(7)], None)).await?;

    assert!(harness.wait_for_ops(1).await, "expected the inner group to be submitted");
    let inner = harness.service.requested_keys().pop().context("expected a requested inner group")?;
    assert!(harness.service.reject(&inner), "expected to reject {}", inner);
    let res = outcome(rx).await?;
    assert_eq!(res, Err(ObjectiveError::GroupInstallationFailed), "expected installation failure got {:?}", res);

    let rx = harness.handle.submit(fixtures::objective(31, NextType::Simple, vec![fixtures::routed(7)], None)).await?;
    let res = drive(&harness, rx).await?;

    assert!(res.is_ok(), "expected the retried objective to install got {:?}", res);
    let inner_adds = added_groups(&harness).into_iter().filter(|group| group.id == GroupId(0x000a_0007)).count();
    assert_eq!(inner_adds, 2, "expected the inner group to be submitted twice got {}", inner_adds);

    harness.shutdown().await
}

#[tokio::test]
async fn expired_chain_is_not_continued_by_a_late_confirmation() -> Result<()> {
    let harness = Harness::with_expiry(Duration::from_millis(200)).await?;
    let rx = harness.handle.submit(fixtures::objective(32, NextType::Simple, vec![fixtures::routed(7)], None)).await?;

    assert!(harness.wait_for_ops(1).await, "expected the inner group to be submitted");
    let inner = harness.service.requested_keys().pop().context("expected a requested inner group")?;
    let res = outcome(rx).await?;
    assert_eq!(res, Err(ObjectiveError::GroupInstallationFailed), "expected installation failure got {:?}", res);

    assert!(harness.service.confirm(&inner), "expected to confirm {}", inner);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let ops = harness.service.ops();
    assert_eq!(ops.len(), 1, "expected no outer group after expiry got {:?}", ops);

    harness.shutdown().await
}

#[tokio::test]
async fn remove_fails_an_install_still_in_flight() -> Result<()> {
    let harness = Harness::new().await?;
    let obj = fixtures::objective(33, NextType::Simple, vec![fixtures::output(5)], Some(100));
    let rx = harness.handle.submit(obj.clone()).await?;
    assert!(harness.wait_for_ops(1).await, "expected the group to be submitted");

    let res = outcome(harness.handle.remove(obj).await?).await?;
    assert_eq!(res, Err(ObjectiveError::GroupMissing), "expected group missing got {:?}", res);
    let res = outcome(rx).await?;
    assert_eq!(res, Err(ObjectiveError::GroupInstallationFailed), "expected installation failure got {:?}", res);

    assert_eq!(harness.confirm_requested(), 1, "expected to confirm the submitted group");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = harness.store.get(33).await?;
    assert!(record.is_none(), "expected no stored record got {:?}", record);

    harness.shutdown().await
}
