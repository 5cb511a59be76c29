use floe_api::{FragmentHandle, FragmentState, NodeEndpoint, QueryId};
use floe_common::Error;
use floe_worker::config::{MemorySettings, Settings};
use floe_worker::{
    Budget, BufferAllocator, DataChannel, DataConnection, FragmentContext, FragmentManager,
    WorkBus, Worker,
};
use std::sync::Arc;

fn peer() -> NodeEndpoint {
    NodeEndpoint::new("10.0.0.7", 31010, 31012)
}

fn local() -> NodeEndpoint {
    NodeEndpoint::new("10.0.0.8", 31010, 31012)
}

fn settings() -> Settings {
    Settings {
        worker_host: "127.0.0.1".to_string(),
        worker_port: 31011,
        coordinator_address: "http://127.0.0.1:31010".to_string(),
        status_interval_ms: 50,
        memory: MemorySettings {
            root_limit_bytes: 64 * 1024,
            fragment_initial_reservation_bytes: 1024,
            fragment_max_reservation_bytes: 8 * 1024,
        },
    }
}

#[test]
fn allocation_succeeds_only_after_attach() {
    let handle = FragmentHandle::new(QueryId::random(), 1, 3);
    let (channel, _closed) = DataChannel::new(peer());
    let connection = Arc::new(DataConnection::new(handle.clone(), channel));

    let err = connection.allocator().buffer(256).unwrap_err();
    assert!(matches!(err, Error::UnboundAllocator));
    assert!(err.is_ordering_defect());

    let budget = Budget::root("fragment", 4096);
    let (manager, _inbound) =
        FragmentManager::new(FragmentContext::new(handle, local(), budget.clone()));
    let before = manager.budget().allocated_bytes().unwrap();
    manager.attach(Arc::clone(&connection)).unwrap();

    let buffer = connection.allocator().buffer(256).unwrap();
    assert_eq!(buffer.len(), 256);
    assert_eq!(manager.budget().allocated_bytes().unwrap(), before + 256);
    assert_eq!(manager.connection_count(), 1);
}

#[test]
fn parked_connections_attach_when_manager_registers() {
    let bus = WorkBus::new();
    let handle = FragmentHandle::new(QueryId::random(), 2, 0);
    let (first, _c1) = bus.accept(peer(), handle.clone()).unwrap();
    let (second, _c2) = bus.accept(peer(), handle.clone()).unwrap();
    assert_eq!(bus.parked_count(&handle), 2);
    assert!(!first.is_attached());

    let budget = Budget::root("fragment", 4096);
    let (manager, _inbound) =
        FragmentManager::new(FragmentContext::new(handle.clone(), local(), budget.clone()));
    assert_eq!(bus.register(Arc::clone(&manager)).unwrap(), 2);

    assert!(first.is_attached());
    assert!(second.is_attached());
    assert_eq!(bus.parked_count(&handle), 0);

    let _batch = second.receive(&[1; 128]).unwrap();
    assert_eq!(budget.allocated(), 128);
}

#[tokio::test]
async fn termination_closes_each_connection_exactly_once() {
    let bus = WorkBus::new();
    let handle = FragmentHandle::new(QueryId::random(), 4, 1);
    let (manager, _inbound) = FragmentManager::new(FragmentContext::new(
        handle.clone(),
        local(),
        Budget::root("fragment", 4096),
    ));
    bus.register(Arc::clone(&manager)).unwrap();

    let mut signals = Vec::new();
    for _ in 0..3 {
        let (_connection, closed) = bus.accept(peer(), handle.clone()).unwrap();
        signals.push(closed);
    }

    assert_eq!(bus.retire(&handle).unwrap(), 3);
    for closed in signals {
        closed.await.unwrap();
    }
    assert_eq!(manager.terminate().unwrap(), 0);
    assert!(bus.manager(&handle).is_none());
}

#[test]
fn oversized_allocation_leaves_child_budget_untouched() {
    let root = Budget::root("worker", 1 << 20);
    let handle = FragmentHandle::new(QueryId::random(), 0, 0);
    let child = root.child(&handle, 0, 512).unwrap();
    let _held = child.buffer(100).unwrap();

    let err = child.buffer(1024).unwrap_err();
    assert!(matches!(err, Error::OutOfBudget { requested: 1024, limit: 512, .. }));
    assert_eq!(child.allocated_bytes().unwrap(), 100);
    assert_eq!(root.allocated(), 100);
}

#[tokio::test]
async fn worker_routes_batches_to_started_fragment() {
    let worker = Worker::new(settings());
    let handle = FragmentHandle::new(QueryId::random(), 1, 0);

    let (early, _closed) = worker.accept_connection(peer(), handle.clone()).unwrap();
    assert!(matches!(
        worker.bus().deliver(&early, b"too soon"),
        Err(Error::UnboundAllocator)
    ));

    let (manager, mut inbound) = worker.start_fragment(handle.clone()).unwrap();
    // The initial reservation is charged to the root as soon as the fragment starts.
    assert_eq!(worker.root_budget().allocated(), 1024);
    assert!(early.is_attached());

    worker.bus().deliver(&early, b"batch-0").unwrap();
    let batch = inbound.recv().await.unwrap();
    assert_eq!(&batch[..], b"batch-0");
    assert_eq!(manager.budget().allocated(), 7);

    let status = manager.status_report(FragmentState::Running, vec![]);
    assert_eq!(status.profile.unwrap().memory_used, 7);
    drop(batch);

    assert_eq!(worker.finish_fragment(&handle).unwrap(), 1);
    assert!(early.is_closed());
    assert!(manager.budget().is_released());
    assert_eq!(worker.root_budget().allocated(), 0);
}

#[test]
fn fragment_larger_than_worker_cannot_start() {
    let mut settings = settings();
    settings.memory.fragment_initial_reservation_bytes = 128 * 1024;
    settings.memory.fragment_max_reservation_bytes = 256 * 1024;
    let worker = Worker::new(settings);

    let handle = FragmentHandle::new(QueryId::random(), 1, 0);
    assert!(matches!(
        worker.start_fragment(handle.clone()),
        Err(Error::OutOfBudget { .. })
    ));
    assert!(worker.bus().manager(&handle).is_none());
}
