//! Integration tests for synod-coordination
//!
//! Every test runs several services against one shared in-memory store, the
//! way several processes share one ensemble.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use synod_config::CoordinationConfiguration;
use synod_coordination::store::{ConnectSettings, CreateMode, EventSink, Stat, StoreResult};
use synod_coordination::*;

fn config() -> CoordinationConfiguration {
    CoordinationConfiguration::builder()
        .server("localhost", Some(2181))
        .session_timeout(Duration::from_secs(2))
        .message_timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

async fn service(store: &InMemoryStore) -> CoordinationService {
    CoordinationService::connect(config(), store).await.unwrap()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
struct Recorder {
    arrivals: Mutex<Vec<String>>,
    departures: Mutex<Vec<String>>,
    leaders: Mutex<Vec<String>>,
    messages: Mutex<Vec<Vec<u8>>>,
    expired: AtomicBool,
}

#[async_trait]
impl GroupEventListener for Recorder {
    async fn on_member_arrival(&self, member_id: &str) {
        self.arrivals.lock().push(member_id.to_string());
    }

    async fn on_member_departure(&self, member_id: &str) {
        self.departures.lock().push(member_id.to_string());
    }

    async fn on_leader_change(&self, leader_id: &str) {
        self.leaders.lock().push(leader_id.to_string());
    }

    async fn on_group_message(&self, data: &[u8]) {
        self.messages.lock().push(data.to_vec());
    }

    async fn on_session_expired(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }
}

struct Reverse;

#[async_trait]
impl GroupEventListener for Reverse {
    async fn on_peer_message(&self, data: &[u8]) -> PeerReply {
        Ok(data.iter().rev().copied().collect())
    }
}

struct Failing;

#[async_trait]
impl GroupEventListener for Failing {
    async fn on_peer_message(&self, _data: &[u8]) -> PeerReply {
        Err("disk full".into())
    }
}

struct Large;

#[async_trait]
impl GroupEventListener for Large {
    async fn on_peer_message(&self, _data: &[u8]) -> PeerReply {
        Ok((0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect())
    }
}

struct Slow;

#[async_trait]
impl GroupEventListener for Slow {
    async fn on_peer_message(&self, data: &[u8]) -> PeerReply {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(data.to_vec())
    }
}

/// Which request-channel operation a [`StallingConnector`] session delays.
#[derive(Clone, Copy)]
enum Stall {
    ChannelCreate,
    ChannelWatch,
}

/// Opens in-memory sessions that stall on one request-channel operation,
/// widening the window between a member node appearing and its channel
/// being served.
struct StallingConnector<'a> {
    store: &'a InMemoryStore,
    stall: Stall,
    delay: Duration,
}

#[async_trait]
impl<'a> StoreConnector for StallingConnector<'a> {
    async fn connect(
        &self,
        settings: &ConnectSettings,
        events: EventSink,
    ) -> StoreResult<Arc<dyn CoordinationStore>> {
        let inner = self.store.connect(settings, events).await?;
        Ok(Arc::new(StallingStore {
            inner,
            stall: self.stall,
            delay: self.delay,
        }))
    }
}

struct StallingStore {
    inner: Arc<dyn CoordinationStore>,
    stall: Stall,
    delay: Duration,
}

fn is_request_channel(path: &str) -> bool {
    path.rsplit_once('/')
        .is_some_and(|(parent, _)| parent.ends_with("/requests"))
}

#[async_trait]
impl CoordinationStore for StallingStore {
    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<String> {
        if matches!(self.stall, Stall::ChannelCreate) && is_request_channel(path) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.create(path, data, mode).await
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()> {
        self.inner.delete(path, version).await
    }

    async fn exists(&self, path: &str, watch: bool) -> StoreResult<Option<Stat>> {
        self.inner.exists(path, watch).await
    }

    async fn get_data(&self, path: &str, watch: bool) -> StoreResult<(Vec<u8>, Stat)> {
        if watch && matches!(self.stall, Stall::ChannelWatch) && is_request_channel(path) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.get_data(path, watch).await
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> StoreResult<Stat> {
        self.inner.set_data(path, data, version).await
    }

    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>> {
        self.inner.get_children(path, watch).await
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }
}

/// A sends to B as soon as B's member node is visible, while B's join is
/// still stalled on its request channel.
async fn reply_from_joining_member(stall: Stall) {
    let store = InMemoryStore::new();
    let a = service(&store).await;
    let ga = a.create_group("rpc").await.unwrap();

    let connector = StallingConnector {
        store: &store,
        stall,
        delay: Duration::from_millis(200),
    };
    let b = CoordinationService::connect(config(), &connector).await.unwrap();
    let joining = tokio::spawn(async move {
        let gb = b.create_group_with_listener("rpc", b"", Arc::new(Reverse)).await;
        (b, gb)
    });

    ga.wait_for_member_count(2, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    let target = ga.member_ids().await.unwrap().pop().unwrap();
    assert_ne!(target, ga.member_id());

    let reply = ga
        .send_receive_timeout(&target, b"ping", Duration::from_secs(3))
        .await
        .unwrap();
    assert_eq!(reply, b"gnip");

    let (_b, gb) = joining.await.unwrap();
    assert_eq!(gb.unwrap().member_id(), target);
}

// ========== Service ==========

#[tokio::test]
async fn test_disabled_service_does_not_start() {
    let config = CoordinationConfiguration::builder()
        .enabled(false)
        .server("localhost", None)
        .build()
        .unwrap();

    let result = CoordinationService::connect(config, &InMemoryStore::new()).await;
    let err = result.unwrap_err();
    assert!(matches!(err, CoordinationError::ServiceDisabled));
    assert!(err.is_permanent());
}

#[tokio::test]
async fn test_connect_fails_when_store_unreachable() {
    let store = InMemoryStore::new();
    store.refuse_connections(u32::MAX);

    let result = CoordinationService::connect(config(), &store).await;
    assert!(matches!(result, Err(CoordinationError::Connection(_))));
}

#[tokio::test]
async fn test_close_unblocks_waiters() {
    let store = InMemoryStore::new();
    let svc = service(&store).await;
    let queue = svc.create_queue("idle", None).await.unwrap();

    let waiting = tokio::spawn(async move { queue.blocking_dequeue().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    svc.close().await;
    let result = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(CoordinationError::Closed)));

    svc.close().await;
    assert!(!svc.is_connected());
}

#[tokio::test]
async fn test_expiry_surfaces_on_blocked_calls() {
    let store = InMemoryStore::new();
    let svc = service(&store).await;
    let queue = svc.create_queue("idle", None).await.unwrap();

    let waiting = tokio::spawn(async move { queue.blocking_dequeue().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(store.expire_session(svc.session_id()));
    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, CoordinationError::SessionExpired));
    assert!(err.is_session_lost());
    assert_eq!(svc.session_state(), SessionState::Expired);
}

// ========== Groups ==========

#[tokio::test]
async fn test_leader_failover() {
    let store = InMemoryStore::new();
    let (a, b, c) = (service(&store).await, service(&store).await, service(&store).await);

    let ga = a.create_group("election").await.unwrap();
    let gb = b.create_group("election").await.unwrap();
    let recorder = Arc::new(Recorder::default());
    gb.set_group_event_listener(recorder.clone());
    let gc = c.create_group("election").await.unwrap();

    assert!(ga.is_leader());
    eventually("arrival of c", || recorder.arrivals.lock().contains(&gc.member_id().to_string())).await;
    assert_eq!(gb.leader_id().as_deref(), Some(ga.member_id()));

    ga.leave().await.unwrap();
    eventually("b to lead", || gb.is_leader()).await;
    assert_eq!(recorder.departures.lock().as_slice(), &[ga.member_id().to_string()]);
    assert_eq!(recorder.leaders.lock().as_slice(), &[gb.member_id().to_string()]);
    eventually("c to follow b", || gc.leader_id().as_deref() == Some(gb.member_id())).await;

    assert!(store.expire_session(b.session_id()));
    eventually("c to lead", || gc.is_leader()).await;
    eventually("b to observe expiry", || recorder.expired.load(Ordering::SeqCst)).await;
    assert!(!gb.is_active());
    assert_eq!(gb.leader_id(), None);
    assert_eq!(gc.member_ids().await.unwrap(), vec![gc.member_id().to_string()]);
}

#[tokio::test]
async fn test_killed_leader_is_replaced_by_next_oldest() {
    let store = InMemoryStore::new();
    let (a, b, c) = (service(&store).await, service(&store).await, service(&store).await);
    let ga = a.create_group("g1").await.unwrap();
    let gb = b.create_group("g1").await.unwrap();
    let gc = c.create_group("g1").await.unwrap();
    let (rb, rc) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));
    gb.set_group_event_listener(rb.clone());
    gc.set_group_event_listener(rc.clone());

    for group in [&ga, &gb, &gc] {
        assert_eq!(group.leader_id().as_deref(), Some(ga.member_id()));
    }

    assert!(store.expire_session(a.session_id()));

    let b_id = gb.member_id().to_string();
    eventually("b to see itself elected", || rb.leaders.lock().contains(&b_id)).await;
    eventually("c to see b elected", || rc.leaders.lock().contains(&b_id)).await;
    assert_eq!(gb.leader_id().as_deref(), Some(gb.member_id()));
    assert_eq!(gc.leader_id().as_deref(), Some(gb.member_id()));
    eventually("a to lose its membership", || !ga.is_active()).await;
}

#[tokio::test]
async fn test_wait_for_leadership() {
    let store = InMemoryStore::new();
    let (a, b) = (service(&store).await, service(&store).await);
    let ga = a.create_group("election").await.unwrap();
    let gb = b.create_group("election").await.unwrap();

    let err = gb
        .wait_for_leadership(Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let waiting = {
        let gb = gb.clone();
        tokio::spawn(async move { gb.wait_for_leadership(None).await })
    };
    a.close().await;

    waiting.await.unwrap().unwrap();
    assert_eq!(gb.member_ids().await.unwrap(), vec![gb.member_id().to_string()]);
    assert!(!ga.is_active());
}

#[tokio::test]
async fn test_wait_for_member_count() {
    let store = InMemoryStore::new();
    let (a, b) = (service(&store).await, service(&store).await);
    let ga = a.create_group("workers").await.unwrap();

    let waiting = {
        let ga = ga.clone();
        tokio::spawn(async move { ga.wait_for_member_count(2, Some(Duration::from_secs(2))).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let gb = b.create_group_with_payload("workers", b"10.0.0.2:9000").await.unwrap();

    waiting.await.unwrap().unwrap();
    assert_eq!(ga.member_ids().await.unwrap().len(), 2);
    assert_eq!(ga.member_payload(gb.member_id()).await.unwrap(), b"10.0.0.2:9000");

    let err = ga
        .wait_for_member_count(3, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_broadcast_reaches_every_member() {
    let store = InMemoryStore::new();
    let (a, b, c) = (service(&store).await, service(&store).await, service(&store).await);
    let ga = a.create_group("chat").await.unwrap();
    let gb = b.create_group("chat").await.unwrap();
    let (ra, rb) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));
    ga.set_group_event_listener(ra.clone());
    gb.set_group_event_listener(rb.clone());

    ga.broadcast(b"hello").await.unwrap();
    eventually("a to receive", || ra.messages.lock().len() == 1).await;
    eventually("b to receive", || rb.messages.lock().len() == 1).await;
    assert_eq!(rb.messages.lock()[0], b"hello");

    // A late joiner starts after the newest message.
    let gc = c.create_group("chat").await.unwrap();
    let rc = Arc::new(Recorder::default());
    gc.set_group_event_listener(rc.clone());

    gb.broadcast(b"second").await.unwrap();
    eventually("c to receive", || rc.messages.lock().len() == 1).await;
    assert_eq!(rc.messages.lock()[0], b"second");
    eventually("a to receive both", || ra.messages.lock().len() == 2).await;
    assert_eq!(*ra.messages.lock(), vec![b"hello".to_vec(), b"second".to_vec()]);

    ga.clear_group_messages().await.unwrap();
    assert!(store.children_of("/synod/groups/chat/broadcast").is_empty());
}

#[tokio::test]
async fn test_send_receive() {
    let store = InMemoryStore::new();
    let (a, b) = (service(&store).await, service(&store).await);
    let ga = a.create_group("rpc").await.unwrap();
    let gb = b.create_group("rpc").await.unwrap();
    gb.set_group_event_listener(Arc::new(Reverse));

    let reply = ga.send_receive(gb.member_id(), b"ping").await.unwrap();
    assert_eq!(reply, b"gnip");

    // Request, response and chunk nodes are consumed.
    eventually("request channel to drain", || {
        store
            .children_of(&format!("/synod/groups/rpc/requests/{}", gb.member_id()))
            .is_empty()
    })
    .await;
    assert!(store.children_of("/synod/groups/rpc/responses").is_empty());
}

#[tokio::test]
async fn test_send_receive_large_reply() {
    let store = InMemoryStore::new();
    let (a, b) = (service(&store).await, service(&store).await);
    let ga = a.create_group("rpc").await.unwrap();
    let gb = b.create_group("rpc").await.unwrap();
    gb.set_group_event_listener(Arc::new(Large));

    let reply = ga.send_receive(gb.member_id(), b"dump").await.unwrap();
    assert_eq!(reply.len(), 3 * 1024 * 1024);
    assert!(reply.iter().enumerate().all(|(i, byte)| *byte == (i % 251) as u8));
}

#[tokio::test]
async fn test_send_receive_failures() {
    let store = InMemoryStore::new();
    let (a, b, c) = (service(&store).await, service(&store).await, service(&store).await);
    let ga = a.create_group("rpc").await.unwrap();
    let gb = b.create_group("rpc").await.unwrap();
    let gc = c.create_group("rpc").await.unwrap();
    gb.set_group_event_listener(Arc::new(Failing));

    match ga.send_receive(gb.member_id(), b"write").await {
        Err(CoordinationError::MessageFailed(message)) => assert!(message.contains("disk full")),
        other => panic!("expected a failed message, got {other:?}"),
    }

    // No listener registered.
    assert!(matches!(
        ga.send_receive(gc.member_id(), b"x").await,
        Err(CoordinationError::MessageFailed(_))
    ));

    assert!(matches!(
        ga.send_receive("member-0000009999", b"x").await,
        Err(CoordinationError::MessageFailed(_))
    ));
}

#[tokio::test]
async fn test_send_receive_timeout_and_departure() {
    let store = InMemoryStore::new();
    let (a, b) = (service(&store).await, service(&store).await);
    let ga = a.create_group("rpc").await.unwrap();
    let gb = b.create_group("rpc").await.unwrap();
    gb.set_group_event_listener(Arc::new(Slow));

    let err = ga
        .send_receive_timeout(gb.member_id(), b"x", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let pending = {
        let ga = ga.clone();
        let target = gb.member_id().to_string();
        tokio::spawn(async move { ga.send_receive(&target, b"y").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    gb.leave().await.unwrap();

    assert!(matches!(
        pending.await.unwrap(),
        Err(CoordinationError::MessageFailed(_))
    ));
}

#[tokio::test]
async fn test_send_receive_waits_for_request_channel() {
    reply_from_joining_member(Stall::ChannelCreate).await;
}

#[tokio::test]
async fn test_send_receive_answered_before_watch_armed() {
    reply_from_joining_member(Stall::ChannelWatch).await;
}

#[tokio::test]
async fn test_dropped_member_leaves_group() {
    let store = InMemoryStore::new();
    let (a, b) = (service(&store).await, service(&store).await);
    let ga = a.create_group("election").await.unwrap();
    let gb = b.create_group("election").await.unwrap();
    let recorder = Arc::new(Recorder::default());
    gb.set_group_event_listener(recorder.clone());

    let dropped = ga.member_id().to_string();
    assert_eq!(gb.leader_id().as_deref(), Some(dropped.as_str()));
    drop(ga);

    eventually("b to lead", || gb.is_leader()).await;
    assert_eq!(recorder.departures.lock().as_slice(), &[dropped.clone()]);
    assert_eq!(gb.member_ids().await.unwrap(), vec![gb.member_id().to_string()]);
    assert!(matches!(
        gb.send_receive(&dropped, b"x").await,
        Err(CoordinationError::MessageFailed(_))
    ));
    eventually("request channel to go", || {
        !store.contains(&format!("/synod/groups/election/requests/{dropped}"))
    })
    .await;
    assert!(a.is_connected());
}

// ========== Locks ==========

#[tokio::test]
async fn test_lock_mutual_exclusion() {
    let store = InMemoryStore::new();
    let (a, b) = (service(&store).await, service(&store).await);
    let first = a.create_lock("jobs", None).await.unwrap();
    let second = b.create_lock("jobs", Some(Duration::from_millis(100))).await.unwrap();

    first.acquire().await.unwrap();
    assert!(first.is_held());

    let err = second.acquire().await.unwrap_err();
    assert!(err.is_timeout());
    assert!(!second.is_held());
    assert!(!second.try_acquire().await.unwrap());

    // Timed-out attempts leave no request node behind.
    eventually("abandoned requests to go", || {
        store.children_of("/synod/locks/jobs").len() == 1
    })
    .await;

    assert!(first.release().await.unwrap());
    assert!(!first.release().await.unwrap());
    second.acquire_timeout(Duration::from_secs(1)).await.unwrap();
    assert!(second.is_held());
}

#[tokio::test]
async fn test_lock_handoff_on_expiry() {
    let store = InMemoryStore::new();
    let (a, b) = (service(&store).await, service(&store).await);
    let held = a.create_lock("jobs", None).await.unwrap();
    let waiting = b.create_lock("jobs", None).await.unwrap();

    held.acquire().await.unwrap();
    let acquiring = tokio::spawn(async move {
        let acquired = waiting.acquire().await;
        acquired.map(|_| waiting)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(store.expire_session(a.session_id()));

    let waiting = tokio::time::timeout(Duration::from_secs(1), acquiring)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(waiting.is_held());
    assert!(!held.release().await.unwrap());
}

#[tokio::test]
async fn test_lock_reentry_is_rejected() {
    let store = InMemoryStore::new();
    let svc = service(&store).await;
    let lock = svc.create_lock("jobs", None).await.unwrap();

    lock.acquire().await.unwrap();
    assert!(matches!(
        lock.acquire().await,
        Err(CoordinationError::IllegalState(_))
    ));
    assert!(lock.is_held());
}

// ========== Barriers ==========

#[tokio::test]
async fn test_barrier_releases_all_parties() {
    let store = InMemoryStore::new();
    let mut services = Vec::new();
    for _ in 0..4 {
        services.push(service(&store).await);
    }

    let mut entering = Vec::new();
    for svc in &services[..3] {
        let barrier = svc
            .create_barrier("start", 3, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        entering.push(tokio::spawn(async move {
            let entered = barrier.enter().await;
            entered.map(|_| barrier)
        }));
    }

    let mut barriers = Vec::new();
    for task in entering {
        barriers.push(task.await.unwrap().unwrap());
    }
    assert!(barriers.iter().all(Barrier::has_entered));
    assert_eq!(barriers[0].party_count().await.unwrap(), 3);

    // Once released, later parties pass too.
    let late = services[3]
        .create_barrier("start", 3, Some(Duration::from_millis(500)))
        .await
        .unwrap();
    late.enter().await.unwrap();

    for barrier in &barriers {
        assert!(barrier.leave().await.unwrap());
    }
}

#[tokio::test]
async fn test_barrier_timeout_withdraws() {
    let store = InMemoryStore::new();
    let svc = service(&store).await;
    let barrier = svc
        .create_barrier("start", 2, Some(Duration::from_millis(100)))
        .await
        .unwrap();

    let err = barrier.enter().await.unwrap_err();
    assert!(err.is_timeout());
    assert!(!barrier.has_entered());
    assert_eq!(barrier.party_count().await.unwrap(), 0);
}

// ========== Queues ==========

#[tokio::test]
async fn test_queue_priority_and_fifo() {
    let store = InMemoryStore::new();
    let (a, b) = (service(&store).await, service(&store).await);
    let producer = a.create_queue("jobs", None).await.unwrap();
    let consumer = b.create_queue("jobs", None).await.unwrap();

    producer.enqueue_with_priority(b"low", 5).await.unwrap();
    producer.enqueue_with_priority(b"high", 1).await.unwrap();
    producer.enqueue(b"first").await.unwrap();
    producer.enqueue(b"second").await.unwrap();

    assert_eq!(consumer.dequeue().await.unwrap().unwrap(), b"high");
    assert_eq!(consumer.dequeue().await.unwrap().unwrap(), b"low");
    assert_eq!(consumer.dequeue().await.unwrap().unwrap(), b"first");
    assert_eq!(consumer.dequeue().await.unwrap().unwrap(), b"second");
    assert_eq!(consumer.dequeue().await.unwrap(), None);
}

#[tokio::test]
async fn test_queue_delivers_each_entry_once() {
    let store = InMemoryStore::new();
    let producer_service = service(&store).await;
    let producer = producer_service.create_queue("jobs", None).await.unwrap();

    let mut consumers = Vec::new();
    let mut consumer_services = Vec::new();
    for _ in 0..3 {
        let svc = service(&store).await;
        let queue = svc.create_queue("jobs", None).await.unwrap();
        consumer_services.push(svc);
        consumers.push(tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(data) = queue
                .blocking_dequeue_timeout(Duration::from_millis(300))
                .await
                .unwrap()
            {
                received.push(String::from_utf8(data).unwrap());
            }
            received
        }));
    }

    for i in 0..30 {
        producer.enqueue(format!("job-{i}").as_bytes()).await.unwrap();
    }

    let mut all = Vec::new();
    for consumer in consumers {
        all.extend(consumer.await.unwrap());
    }
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 30);
    assert_eq!(unique.len(), 30);
    assert!(producer.is_empty().await.unwrap());
}
