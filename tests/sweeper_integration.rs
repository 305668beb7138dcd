//! Integration tests for the expiration sweeper
//!
//! This test suite validates:
//! - Expired, unreferenced sessions are reclaimed with bounded concurrency
//! - Sessions re-referenced after the snapshot survive
//! - End hook failures are reported but do not keep sessions alive
//! - Shutdown waits for in-flight session ends

mod common;

use async_trait::async_trait;
use scopekeeper::scope::{ScopeFactory, ScopeId, ServiceCollection};
use scopekeeper::session::{ExpirationSweeper, Session, SessionEndHook, SessionRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct SlowHook {
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl SessionEndHook for SlowHook {
    async fn on_session_ended(&self, _session: &Session) -> anyhow::Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct RejectingHook;

#[async_trait]
impl SessionEndHook for RejectingHook {
    async fn on_session_ended(&self, session: &Session) -> anyhow::Result<()> {
        anyhow::bail!("archive unavailable for {}", session.id())
    }
}

struct GatedHook {
    started: Notify,
    finished: AtomicUsize,
}

#[async_trait]
impl SessionEndHook for GatedHook {
    async fn on_session_ended(&self, _session: &Session) -> anyhow::Result<()> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn gated_registry() -> (Arc<GatedHook>, Arc<SessionRegistry>) {
    let hook = Arc::new(GatedHook {
        started: Notify::new(),
        finished: AtomicUsize::new(0),
    });
    let scopes = Arc::new(ScopeFactory::new(ServiceCollection::new().build()));
    let registry = Arc::new(
        SessionRegistry::new(scopes, chrono::Duration::minutes(30))
            .with_end_hook(Arc::clone(&hook) as Arc<dyn SessionEndHook>),
    );
    (hook, registry)
}

fn expire_unreferenced(registry: &SessionRegistry, count: usize) -> Vec<Arc<Session>> {
    (0..count)
        .map(|_| {
            let scope = ScopeId::new();
            let session = registry.create_session(scope).unwrap();
            session.set_duration(Some(chrono::Duration::milliseconds(-1)));
            registry.remove_scope_ref(&scope);
            session
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweep_bounds_concurrent_cleanups() {
    let hook = Arc::new(SlowHook {
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    let scopes = Arc::new(ScopeFactory::new(ServiceCollection::new().build()));
    let registry = Arc::new(
        SessionRegistry::new(scopes, chrono::Duration::minutes(30))
            .with_end_hook(Arc::clone(&hook) as Arc<dyn SessionEndHook>),
    );
    expire_unreferenced(&registry, 10);

    let sweeper = ExpirationSweeper::new(Arc::clone(&registry), Duration::from_secs(60), 2);
    let report = sweeper.sweep_once().await;

    assert_eq!(report.candidates, 10);
    assert_eq!(report.ended, 10);
    assert!(registry.is_empty());
    assert_eq!(hook.calls.load(Ordering::SeqCst), 10);
    assert!(hook.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_rereferenced_session_survives_sweep() {
    let registry = common::registry();
    let sessions = expire_unreferenced(&registry, 2);
    let snapshot = registry.reclaimable_sessions(chrono::Utc::now());
    assert_eq!(snapshot.len(), 2);

    let revived = ScopeId::new();
    registry.add_scope_ref(&sessions[0], revived).unwrap();

    let sweeper = ExpirationSweeper::new(Arc::clone(&registry), Duration::from_secs(60), 4);
    let report = sweeper.sweep_once().await;

    assert_eq!(report.ended, 1);
    assert!(registry.contains(&sessions[0].id()));
    assert!(!registry.contains(&sessions[1].id()));
    assert!(!sessions[0].is_ended());
}

#[tokio::test]
async fn test_hook_failure_reported_and_session_removed() {
    let scopes = Arc::new(ScopeFactory::new(ServiceCollection::new().build()));
    let registry = Arc::new(
        SessionRegistry::new(scopes, chrono::Duration::minutes(30))
            .with_end_hook(Arc::new(RejectingHook)),
    );
    let sessions = expire_unreferenced(&registry, 1);

    let sweeper = ExpirationSweeper::new(Arc::clone(&registry), Duration::from_secs(60), 1);
    let report = sweeper.sweep_once().await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.ended, 0);
    assert!(!registry.contains(&sessions[0].id()));
    assert!(registry
        .get_session(&sessions[0].id())
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_sweeper_from_config_stops_on_shutdown() {
    let registry = common::registry();
    let config = scopekeeper::config::SweeperConfig::default();
    let sweeper = ExpirationSweeper::from_config(Arc::clone(&registry), &config);
    let token = sweeper.shutdown_token();
    let task = tokio::spawn(sweeper.run());

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("sweeper did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_handle_shutdown_drains_in_flight_ends() {
    let (hook, registry) = gated_registry();
    let sessions = expire_unreferenced(&registry, 1);

    let handle =
        ExpirationSweeper::new(Arc::clone(&registry), Duration::from_millis(10), 1).spawn();
    tokio::time::timeout(Duration::from_secs(2), hook.started.notified())
        .await
        .expect("sweep never started ending the session");

    handle.shutdown().await;

    assert_eq!(hook.finished.load(Ordering::SeqCst), 1);
    assert!(!registry.contains(&sessions[0].id()));
    assert!(sessions[0].is_ended());
}

#[tokio::test]
async fn test_run_returns_after_in_flight_ends_complete() {
    let (hook, registry) = gated_registry();
    let sessions = expire_unreferenced(&registry, 1);

    let sweeper = ExpirationSweeper::new(Arc::clone(&registry), Duration::from_millis(10), 1);
    let token = sweeper.shutdown_token();
    let task = tokio::spawn(sweeper.run());

    tokio::time::timeout(Duration::from_secs(2), hook.started.notified())
        .await
        .expect("sweep never started ending the session");
    token.cancel();
    assert_eq!(hook.finished.load(Ordering::SeqCst), 0);

    task.await.unwrap();
    assert_eq!(hook.finished.load(Ordering::SeqCst), 1);
    assert!(!registry.contains(&sessions[0].id()));
}
