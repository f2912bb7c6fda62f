//! Lifecycle and ownership state machine: acquisition, loss, stop.

mod common;

use std::time::Duration;

use common::*;
use weft::persistence::{
    CreateWorkflowExecutionRequest, ExecutionInfo, StoreError, UpdateWorkflowExecutionRequest,
    WorkflowMutation, WorkflowSnapshot,
};
use weft::{Deadline, ShardError, Task, TaskCategory, TaskKind, TasksByCategory, ZERO_TIME};

fn snapshot_for(ns: &weft::Namespace, seed: u128) -> WorkflowSnapshot {
    let key = workflow_key(ns.id, seed);
    let mut tasks = TasksByCategory::new();
    tasks.insert(
        TaskCategory::Transfer,
        vec![Task::new(key.clone(), TaskKind::WorkflowTask, ZERO_TIME, 0)],
    );
    WorkflowSnapshot {
        execution_info: ExecutionInfo::new(ns.id, key.workflow_id.clone()),
        run_id: key.run_id,
        tasks,
    }
}

fn mutation_for(ns: &weft::Namespace, seed: u128) -> WorkflowMutation {
    let snapshot = snapshot_for(ns, seed);
    WorkflowMutation {
        execution_info: snapshot.execution_info,
        run_id: snapshot.run_id,
        tasks: snapshot.tasks,
    }
}

#[test]
fn cold_acquire_steals_the_shard() {
    let shard = TestShardBuilder::new().build();
    start_and_wait(&shard);

    let row = shard.shard_store.row();
    assert_eq!(row.range_id, 5);
    assert_eq!(row.owner, "this-host");
    assert_eq!(row.stolen_since_renew, 1);

    // First id of range 5 with 8 range-size bits.
    assert_eq!(shard.ctx.generate_task_id().unwrap(), 5 << 8);
    assert_eq!(shard.ctx.max_task_id_for_current_range(), (6 << 8) - 1);
    let read_level = shard
        .ctx
        .queue_max_read_level(TaskCategory::Transfer, &LOCAL_CLUSTER.into())
        .unwrap();
    assert_eq!(read_level.task_id, (5 << 8) - 1);
}

#[test]
fn operations_fail_fast_before_acquisition() {
    let shard = TestShardBuilder::new().build();
    // Not started: status unknown.
    let err = shard.ctx.generate_task_id().unwrap_err();
    assert!(matches!(err, ShardError::ShardStatusUnknown));
    let err = shard
        .ctx
        .queue_ack_level(TaskCategory::Transfer)
        .unwrap_err();
    assert!(matches!(err, ShardError::ShardStatusUnknown));
}

#[test]
fn ownership_lost_on_write_stops_the_shard() {
    let shard = TestShardBuilder::new().build();
    start_and_wait(&shard);

    let ns = namespace(1, LOCAL_CLUSTER);
    shard.registry.insert(ns.clone());

    shard.exec_store.fail_next(
        "update",
        StoreError::ShardOwnershipLost {
            new_owner: "other-host".into(),
        },
    );
    let request = UpdateWorkflowExecutionRequest {
        shard_id: shard.ctx.shard_id(),
        range_id: 0,
        mutation: mutation_for(&ns, 2),
        new_snapshot: None,
    };
    let err = shard
        .ctx
        .update_workflow_execution(Deadline::none(), request)
        .unwrap_err();
    assert!(matches!(
        err,
        ShardError::Store(StoreError::ShardOwnershipLost { .. })
    ));

    // Shard is surrendered: the controller is told to close us, and all
    // further calls see a closed shard.
    let closed = shard
        .closed_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("close callback fired");
    assert_eq!(closed, shard.ctx.shard_id());
    assert!(matches!(
        shard.ctx.generate_task_id().unwrap_err(),
        ShardError::ShardClosed
    ));
    shard.ctx.finish_stop();
}

#[test]
fn outcome_unknown_write_triggers_reacquisition() {
    let shard = TestShardBuilder::new().build();
    start_and_wait(&shard);
    assert_eq!(shard.shard_store.row().range_id, 5);

    let ns = namespace(1, LOCAL_CLUSTER);
    shard.registry.insert(ns.clone());

    shard.exec_store.fail_next(
        "create",
        StoreError::Timeout {
            message: "write may or may not have landed".into(),
        },
    );
    let request = CreateWorkflowExecutionRequest {
        shard_id: shard.ctx.shard_id(),
        range_id: 0,
        new_snapshot: snapshot_for(&ns, 3),
    };
    let err = shard
        .ctx
        .create_workflow_execution(Deadline::none(), request)
        .unwrap_err();
    assert!(matches!(err, ShardError::Store(StoreError::Timeout { .. })));

    // Background re-acquisition bumps the range so a subsequent read
    // against the new range resolves the write outcome.
    wait_for(Duration::from_secs(5), || {
        shard.shard_store.row().range_id == 6
    });
    wait_acquired(&shard.ctx);

    // Ids jump past the abandoned range.
    assert!(shard.ctx.generate_task_id().unwrap() >= 6 << 8);
    // The same engine keeps running; no second engine was created.
    assert_eq!(shard.factory.created(), 1);
    assert_eq!(shard.engine().started(), 1);
}

#[test]
fn engine_created_once_and_stopped_once() {
    let shard = TestShardBuilder::new().build();
    start_and_wait(&shard);
    assert_eq!(shard.factory.created(), 1);
    assert_eq!(shard.engine().started(), 1);
    assert_eq!(shard.engine().stopped(), 0);

    shard.ctx.unload();
    shard
        .closed_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("close callback fired");
    shard.ctx.finish_stop();

    assert_eq!(shard.engine().stopped(), 1);
    assert!(!shard.ctx.is_valid());
}

#[test]
fn unload_before_start_never_creates_an_engine() {
    let shard = TestShardBuilder::new().build();
    shard.ctx.unload();
    shard
        .closed_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("close callback fired");
    shard.ctx.finish_stop();

    assert_eq!(shard.factory.created(), 0);
    assert!(matches!(
        shard.ctx.generate_task_id().unwrap_err(),
        ShardError::ShardClosed
    ));
    // Engine waiters are not left hanging.
    let err = shard.ctx.engine(Deadline::none()).err().unwrap();
    assert!(matches!(err, ShardError::ShardClosed));
}

#[test]
fn unretryable_acquire_failure_stops_the_shard() {
    let shard = TestShardBuilder::new().build();
    shard.shard_store.fail_next_get(StoreError::InvalidRequest {
        message: "schema mismatch".into(),
    });
    shard.ctx.start();

    shard
        .closed_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("close callback fired");
    shard.ctx.finish_stop();
    assert!(!shard.ctx.is_valid());
}

#[test]
fn assert_ownership_checks_the_lease() {
    let shard = TestShardBuilder::new().build();
    start_and_wait(&shard);
    shard.ctx.assert_ownership(Deadline::none()).unwrap();

    shard.shard_store.fail_next_assert(StoreError::ShardOwnershipLost {
        new_owner: "thief".into(),
    });
    let err = shard.ctx.assert_ownership(Deadline::none()).unwrap_err();
    assert!(matches!(
        err,
        ShardError::Store(StoreError::ShardOwnershipLost { .. })
    ));
    shard
        .closed_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("close callback fired");
}

#[test]
fn vector_clocks_come_from_the_allocator() {
    let shard = TestShardBuilder::new().build();
    start_and_wait(&shard);

    let current = shard.ctx.current_vector_clock();
    let fresh = shard.ctx.new_vector_clock().unwrap();
    assert_eq!(fresh.id, shard.ctx.shard_id().get());
    assert_eq!(fresh.clock, current.clock);
    assert!(shard.ctx.current_vector_clock().clock > fresh.clock);
}
