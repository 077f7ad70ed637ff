//! Integration tests for common Synod workflows.
//!
//! These tests run several services against one in-memory store, starting
//! from an XML configuration file the way a deployed process does.

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use synod::*;
use tokio_test::{assert_err, assert_ok};

const CONFIG_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<coordinationClient enabled="true">
    <sessionTimeout>2000</sessionTimeout>
    <rootPath>/workflows</rootPath>
    <messageTimeout>3000</messageTimeout>
    <servers>
        <server host="zk1.internal" port="2181"/>
    </servers>
</coordinationClient>
"#;

fn load_config() -> CoordinationConfiguration {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG_XML.as_bytes()).unwrap();
    CoordinationConfiguration::from_file(file.path()).unwrap()
}

async fn start(store: &InMemoryStore) -> CoordinationService {
    CoordinationService::connect(load_config(), store).await.unwrap()
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_config_file_drives_service() {
    let config = load_config();
    assert_eq!(config.root_path, "/workflows");
    assert_eq!(config.message_timeout, Duration::from_secs(3));

    let store = InMemoryStore::new();
    tokio_test::block_on(async {
        let service = CoordinationService::connect(config, &store).await.unwrap();
        assert_eq!(service.configuration().connection_string(), "zk1.internal:2181");
        service.close().await;
    });
}

#[test]
fn test_logging_config_defaults_to_json() {
    let config = logging::LogConfig::from_lookup(|_| None);
    assert_eq!(config.format, logging::Format::Json);
    assert_eq!(config.level, "info");
}

// =============================================================================
// Leader hands out work
// =============================================================================

struct Coordinator {
    processed: AtomicUsize,
}

#[async_trait]
impl GroupEventListener for Coordinator {
    async fn on_peer_message(&self, data: &[u8]) -> PeerReply {
        let done: usize = std::str::from_utf8(data)?.parse()?;
        let total = self.processed.fetch_add(done, Ordering::SeqCst) + done;
        Ok(total.to_string().into_bytes())
    }
}

#[tokio::test]
async fn test_leader_distributes_jobs() {
    let store = InMemoryStore::new();
    let leader_service = start(&store).await;
    let leader = leader_service.create_group("pipeline").await.unwrap();
    let coordinator = Arc::new(Coordinator {
        processed: AtomicUsize::new(0),
    });
    leader.set_group_event_listener(coordinator.clone());
    assert!(leader.is_leader());

    let jobs = leader_service.create_queue("jobs", None).await.unwrap();
    for i in 0..12 {
        assert_ok!(jobs.enqueue(format!("{i}").as_bytes()).await);
    }

    let mut workers = Vec::new();
    let mut services = Vec::new();
    for _ in 0..3 {
        let service = start(&store).await;
        let group = service.create_group("pipeline").await.unwrap();
        let queue = service.create_queue("jobs", None).await.unwrap();
        let done = service
            .create_barrier("done", 3, Some(Duration::from_secs(3)))
            .await
            .unwrap();
        services.push(service);

        workers.push(tokio::spawn(async move {
            let mut count = 0;
            while let Some(_job) = queue.dequeue().await? {
                count += 1;
            }
            let leader_id = group.leader_id().unwrap_or_default();
            group.send_receive(&leader_id, count.to_string().as_bytes()).await?;
            done.enter().await?;
            Ok::<_, CoordinationError>(count)
        }));
    }

    let mut total = 0;
    for worker in workers {
        total += worker.await.unwrap().unwrap();
    }
    assert_eq!(total, 12);
    assert_eq!(coordinator.processed.load(Ordering::SeqCst), 12);
    assert!(jobs.is_empty().await.unwrap());

    for service in &services {
        service.close().await;
    }
    leader_service.close().await;
}

// =============================================================================
// Guarded maintenance
// =============================================================================

#[tokio::test]
async fn test_maintenance_runs_once_at_a_time() {
    let store = InMemoryStore::new();
    let running = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    let mut services = Vec::new();

    for _ in 0..4 {
        let service = start(&store).await;
        let lock = service.create_lock("compaction", None).await.unwrap();
        services.push(service);

        let running = running.clone();
        tasks.push(tokio::spawn(async move {
            lock.acquire().await?;
            assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
            tokio::time::sleep(Duration::from_millis(10)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            lock.release().await
        }));
    }

    for task in tasks {
        assert!(task.await.unwrap().unwrap());
    }
    assert!(store.children_of("/workflows/locks/compaction").is_empty());
}

#[tokio::test]
async fn test_closed_service_rejects_new_primitives() {
    let store = InMemoryStore::new();
    let service = start(&store).await;
    service.close().await;

    assert_err!(service.create_group("pipeline").await);
    assert_err!(service.create_lock("compaction", None).await);
}
