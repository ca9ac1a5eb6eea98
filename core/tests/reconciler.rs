//! Reconciliation loop tests against in-memory runtime, spawner and probe.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portbridge_core::docker::{ContainerAction, ContainerEvent, ContainerPorts, RuntimeError};
use portbridge_core::killer::{process_alive, KillError};
use portbridge_core::ports::{ContainerRuntime, EventFeed, PortProbe, TunnelSpawner};
use portbridge_core::tunnel::{read_port_list, PortEntry, ProcessHandle, SpawnError};
use portbridge_core::{
    Error, Reconciler, ReconcilerState, SshOptions, SshTunnelController, StatePaths, StateStore,
    TunnelRegistry,
};
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeRuntime {
    containers: Arc<Mutex<HashMap<String, ContainerPorts>>>,
    list_fails: bool,
    feed: Mutex<Option<EventFeed>>,
    /// Running, but started after the listing snapshot was taken.
    unlisted: HashSet<String>,
    /// Raised while containers are being listed; only a prior subscriber sees them.
    raised_while_listing: Vec<ContainerEvent>,
    subscriber: Mutex<Option<mpsc::Sender<Result<ContainerEvent, RuntimeError>>>>,
    listed: AtomicBool,
}

impl FakeRuntime {
    fn with(containers: impl IntoIterator<Item = ContainerPorts>) -> Self {
        Self {
            containers: Arc::new(Mutex::new(
                containers
                    .into_iter()
                    .map(|c| (c.name.clone(), c))
                    .collect(),
            )),
            ..Default::default()
        }
    }
}

impl ContainerRuntime for FakeRuntime {
    async fn running_containers(&self) -> Result<Vec<ContainerPorts>, RuntimeError> {
        if self.list_fails {
            return Err(RuntimeError::StreamClosed);
        }
        self.listed.store(true, Ordering::SeqCst);

        // Dropping the sender afterwards ends the feed once these are drained.
        let subscriber = self.subscriber.lock().unwrap().take();
        if let Some(tx) = subscriber {
            for event in &self.raised_while_listing {
                tx.try_send(Ok(event.clone())).unwrap();
            }
        }

        let mut containers: Vec<_> = self
            .containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| !self.unlisted.contains(&c.name))
            .cloned()
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }

    async fn container_ports(&self, container: &str) -> Result<ContainerPorts, RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .get(container)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))
    }

    fn subscribe(&self) -> EventFeed {
        if let Some(feed) = self.feed.lock().unwrap().take() {
            return feed;
        }

        let (tx, rx) = mpsc::channel(16);
        // Subscribing after the listing means everything raised during it was missed.
        if !self.listed.load(Ordering::SeqCst) {
            *self.subscriber.lock().unwrap() = Some(tx);
        }
        rx
    }
}

#[derive(Default)]
struct SpawnLog {
    spawned: Vec<u16>,
    killed: Vec<ProcessHandle>,
}

#[derive(Default, Clone)]
struct FakeSpawner {
    log: Arc<Mutex<SpawnLog>>,
    privileged: HashSet<u16>,
}

impl TunnelSpawner for FakeSpawner {
    async fn spawn(&mut self, port: u16) -> Result<ProcessHandle, SpawnError> {
        let mut log = self.log.lock().unwrap();
        log.spawned.push(port);
        if self.privileged.contains(&port) {
            return Err(SpawnError::PrivilegedPort { port });
        }
        Ok(ProcessHandle::new(10_000 + u32::from(port)))
    }

    fn kill(&mut self, handle: ProcessHandle) -> Result<(), KillError> {
        self.log.lock().unwrap().killed.push(handle);
        Ok(())
    }

    fn kill_all(&mut self) -> usize {
        0
    }
}

#[derive(Default)]
struct FakeProbe {
    busy: HashSet<u16>,
}

impl PortProbe for FakeProbe {
    fn is_port_in_use(&self, port: u16) -> bool {
        self.busy.contains(&port)
    }
}

type TestReconciler = Reconciler<FakeRuntime, FakeSpawner, FakeProbe>;

struct Harness {
    reconciler: TestReconciler,
    log: Arc<Mutex<SpawnLog>>,
    paths: StatePaths,
    _dir: TempDir,
}

fn harness(runtime: FakeRuntime, spawner: FakeSpawner, probe: FakeProbe) -> Harness {
    let dir = tempdir().unwrap();
    let paths = StatePaths::new(dir.path());
    let log = spawner.log.clone();
    let registry = TunnelRegistry::new(spawner, probe, StateStore::new(&paths));
    Harness {
        reconciler: Reconciler::new(runtime, registry),
        log,
        paths,
        _dir: dir,
    }
}

fn web1() -> ContainerPorts {
    ContainerPorts::new("web1", [8080])
}

fn persisted(paths: &StatePaths) -> Option<HashSet<PortEntry>> {
    read_port_list(&paths.ports_file())
        .unwrap()
        .map(|entries| entries.into_iter().collect())
}

fn registry_entries(reconciler: &TestReconciler) -> HashSet<PortEntry> {
    reconciler.registry().tunnels().map(PortEntry::from).collect()
}

// ============================================================================
// Bootstrap
// ============================================================================

#[tokio::test]
async fn test_bootstrap_forwards_published_ports() {
    let runtime = FakeRuntime::with([web1(), ContainerPorts::new("db", [5432, 5433])]);
    let mut h = harness(runtime, FakeSpawner::default(), FakeProbe::default());

    h.reconciler.bootstrap().await.unwrap();

    assert_eq!(h.reconciler.state(), ReconcilerState::Streaming);
    assert_eq!(h.reconciler.registry().len(), 3);
    assert_eq!(
        persisted(&h.paths).unwrap(),
        HashSet::from([
            PortEntry::new("web1", 8080),
            PortEntry::new("db", 5432),
            PortEntry::new("db", 5433),
        ])
    );
}

#[tokio::test]
async fn test_bootstrap_single_container_single_line() {
    let mut h = harness(
        FakeRuntime::with([web1()]),
        FakeSpawner::default(),
        FakeProbe::default(),
    );

    h.reconciler.bootstrap().await.unwrap();

    let tunnel = h.reconciler.registry().get(8080).unwrap();
    assert_eq!(tunnel.container_name, "web1");
    let content = fs::read_to_string(h.paths.ports_file()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("web1") && lines[0].contains("8080"));
}

#[tokio::test]
async fn test_bootstrap_skips_failing_ports() {
    let runtime = FakeRuntime::with([
        ContainerPorts::new("proxy", [80]),
        web1(),
        ContainerPorts::new("db", [5432]),
    ]);
    let spawner = FakeSpawner {
        privileged: HashSet::from([80]),
        ..Default::default()
    };
    let probe = FakeProbe {
        busy: HashSet::from([5432]),
    };
    let mut h = harness(runtime, spawner, probe);

    h.reconciler.bootstrap().await.unwrap();

    assert_eq!(h.reconciler.state(), ReconcilerState::Streaming);
    assert!(h.reconciler.registry().get(80).is_none());
    assert!(h.reconciler.registry().get(5432).is_none());
    assert!(h.reconciler.registry().contains(8080));
    // The occupied port never reached the spawner.
    assert_eq!(h.log.lock().unwrap().spawned, vec![80, 8080]);
}

#[tokio::test]
async fn test_bootstrap_fails_when_listing_fails() {
    let runtime = FakeRuntime {
        list_fails: true,
        ..Default::default()
    };
    let mut h = harness(runtime, FakeSpawner::default(), FakeProbe::default());

    assert!(matches!(
        h.reconciler.bootstrap().await,
        Err(Error::Runtime(_))
    ));
    assert_eq!(h.reconciler.state(), ReconcilerState::Stopped);
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_stop_event_removes_tunnels_and_files() {
    let mut h = harness(
        FakeRuntime::with([web1()]),
        FakeSpawner::default(),
        FakeProbe::default(),
    );
    h.reconciler.bootstrap().await.unwrap();
    assert!(h.paths.ports_file().exists());

    h.reconciler
        .handle_event(ContainerEvent::new(ContainerAction::Stop, "web1"))
        .await
        .unwrap();

    assert!(h.reconciler.registry().is_empty());
    assert!(!h.paths.ports_file().exists());
    assert!(!h.paths.tunnel_pids_file().exists());
    assert_eq!(
        h.log.lock().unwrap().killed,
        vec![ProcessHandle::new(10_000 + 8080)]
    );
}

#[tokio::test]
async fn test_stop_event_for_removed_container_uses_owned_ports() {
    let runtime = FakeRuntime::with([ContainerPorts::new("worker", [7000, 7001])]);
    let containers = runtime.containers.clone();
    let mut h = harness(runtime, FakeSpawner::default(), FakeProbe::default());

    h.reconciler
        .handle_event(ContainerEvent::new(ContainerAction::Start, "worker"))
        .await
        .unwrap();
    assert_eq!(h.reconciler.registry().len(), 2);

    // Removed before its stop event is handled, so inspect reports nothing.
    containers.lock().unwrap().remove("worker");
    h.reconciler
        .handle_event(ContainerEvent::new(ContainerAction::Stop, "worker"))
        .await
        .unwrap();

    assert!(h.reconciler.registry().is_empty());
    assert!(!h.paths.ports_file().exists());
}

#[tokio::test]
async fn test_stop_event_keeps_port_owned_by_other_container() {
    let runtime = FakeRuntime::with([web1(), ContainerPorts::new("web2", [8080, 8081])]);
    let mut h = harness(runtime, FakeSpawner::default(), FakeProbe::default());

    h.reconciler
        .handle_event(ContainerEvent::new(ContainerAction::Start, "web1"))
        .await
        .unwrap();
    h.reconciler
        .handle_event(ContainerEvent::new(ContainerAction::Start, "web2"))
        .await
        .unwrap();
    h.reconciler
        .handle_event(ContainerEvent::new(ContainerAction::Stop, "web2"))
        .await
        .unwrap();

    assert_eq!(h.reconciler.registry().get(8080).unwrap().container_name, "web1");
    assert!(!h.reconciler.registry().contains(8081));
    assert_eq!(
        persisted(&h.paths).unwrap(),
        HashSet::from([PortEntry::new("web1", 8080)])
    );
}

#[tokio::test]
async fn test_start_event_for_missing_container_is_skipped() {
    let mut h = harness(
        FakeRuntime::default(),
        FakeSpawner::default(),
        FakeProbe::default(),
    );

    h.reconciler
        .handle_event(ContainerEvent::new(ContainerAction::Start, "ghost"))
        .await
        .unwrap();

    assert!(h.reconciler.registry().is_empty());
    assert!(h.log.lock().unwrap().spawned.is_empty());
}

#[tokio::test]
async fn test_start_event_forwards_once() {
    let mut h = harness(
        FakeRuntime::with([web1()]),
        FakeSpawner::default(),
        FakeProbe::default(),
    );

    let start = ContainerEvent::new(ContainerAction::Start, "web1");
    h.reconciler.handle_event(start.clone()).await.unwrap();
    h.reconciler.handle_event(start).await.unwrap();

    assert_eq!(h.log.lock().unwrap().spawned, vec![8080]);
    assert_eq!(
        persisted(&h.paths).unwrap(),
        HashSet::from([PortEntry::new("web1", 8080)])
    );
}

#[tokio::test]
async fn test_other_actions_are_ignored() {
    let mut h = harness(
        FakeRuntime::with([web1()]),
        FakeSpawner::default(),
        FakeProbe::default(),
    );

    h.reconciler
        .handle_event(ContainerEvent::new(
            ContainerAction::Other("die".to_string()),
            "web1",
        ))
        .await
        .unwrap();

    assert!(h.reconciler.registry().is_empty());
    assert!(h.log.lock().unwrap().spawned.is_empty());
}

#[tokio::test]
async fn test_persisted_list_tracks_registry() {
    let runtime = FakeRuntime::with([
        web1(),
        ContainerPorts::new("web2", [8081, 8443]),
        ContainerPorts::new("db", [5432]),
    ]);
    let mut h = harness(runtime, FakeSpawner::default(), FakeProbe::default());

    let events = [
        ContainerEvent::new(ContainerAction::Start, "web1"),
        ContainerEvent::new(ContainerAction::Start, "web2"),
        ContainerEvent::new(ContainerAction::Stop, "web1"),
        ContainerEvent::new(ContainerAction::Start, "db"),
        ContainerEvent::new(ContainerAction::Start, "web1"),
        ContainerEvent::new(ContainerAction::Stop, "web2"),
    ];
    for event in events {
        h.reconciler.handle_event(event).await.unwrap();
        let on_disk = persisted(&h.paths).unwrap_or_default();
        assert_eq!(on_disk, registry_entries(&h.reconciler));
    }

    assert_eq!(
        registry_entries(&h.reconciler),
        HashSet::from([PortEntry::new("web1", 8080), PortEntry::new("db", 5432)])
    );
}

// ============================================================================
// Stream
// ============================================================================

#[tokio::test]
async fn test_stream_skips_malformed_and_stops_on_transport_error() {
    let mut h = harness(
        FakeRuntime::with([web1()]),
        FakeSpawner::default(),
        FakeProbe::default(),
    );
    let (tx, mut feed) = mpsc::channel(8);

    tx.send(Err(RuntimeError::MalformedEvent("stop event without actor".into())))
        .await
        .unwrap();
    tx.send(Ok(ContainerEvent::new(ContainerAction::Start, "web1")))
        .await
        .unwrap();
    tx.send(Err(RuntimeError::NotFound("web9".into()))).await.unwrap();
    tx.send(Err(RuntimeError::Transport(
        bollard::errors::Error::RequestTimeoutError,
    )))
    .await
    .unwrap();
    tx.send(Ok(ContainerEvent::new(ContainerAction::Stop, "web1")))
        .await
        .unwrap();

    let result = h.reconciler.stream(&mut feed).await;

    assert!(matches!(result, Err(Error::Runtime(RuntimeError::Transport(_)))));
    assert_eq!(h.reconciler.state(), ReconcilerState::Stopped);
    // The stop event after the failure was never processed.
    assert!(h.reconciler.registry().contains(8080));
}

#[tokio::test]
async fn test_stream_ends_when_feed_closes() {
    let mut h = harness(
        FakeRuntime::default(),
        FakeSpawner::default(),
        FakeProbe::default(),
    );
    let (tx, mut feed) = mpsc::channel(1);
    drop(tx);

    assert!(matches!(
        h.reconciler.stream(&mut feed).await,
        Err(Error::Runtime(RuntimeError::StreamClosed))
    ));
    assert_eq!(h.reconciler.state(), ReconcilerState::Stopped);
}

#[tokio::test]
async fn test_run_cleans_stale_state_then_follows_events() {
    let (tx, feed) = mpsc::channel(8);
    let runtime = FakeRuntime {
        feed: Mutex::new(Some(feed)),
        ..FakeRuntime::with([web1(), ContainerPorts::new("db", [5432])])
    };
    let mut h = harness(runtime, FakeSpawner::default(), FakeProbe::default());

    let mut dead = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = dead.id();
    dead.wait().unwrap();
    fs::write(h.paths.tunnel_pids_file(), format!("{}\n", dead_pid)).unwrap();
    fs::write(h.paths.ports_file(), "old 1234\n").unwrap();

    tx.send(Ok(ContainerEvent::new(ContainerAction::Stop, "db")))
        .await
        .unwrap();
    drop(tx);

    let result = h.reconciler.run().await;

    assert!(matches!(result, Err(Error::Runtime(RuntimeError::StreamClosed))));
    assert_eq!(
        persisted(&h.paths).unwrap(),
        HashSet::from([PortEntry::new("web1", 8080)])
    );
}

#[tokio::test]
async fn test_run_forwards_container_started_during_bootstrap() {
    let mut runtime = FakeRuntime::with([web1(), ContainerPorts::new("late", [9000])]);
    runtime.unlisted = HashSet::from(["late".to_string()]);
    runtime.raised_while_listing = vec![ContainerEvent::new(ContainerAction::Start, "late")];
    let mut h = harness(runtime, FakeSpawner::default(), FakeProbe::default());

    let result = h.reconciler.run().await;

    assert!(matches!(result, Err(Error::Runtime(RuntimeError::StreamClosed))));
    assert!(h.reconciler.registry().contains(8080));
    assert_eq!(h.reconciler.registry().get(9000).unwrap().container_name, "late");
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let mut h = harness(
        FakeRuntime::with([web1(), ContainerPorts::new("db", [5432])]),
        FakeSpawner::default(),
        FakeProbe::default(),
    );
    h.reconciler.bootstrap().await.unwrap();

    h.reconciler.shutdown();
    h.reconciler.shutdown();

    assert_eq!(h.reconciler.state(), ReconcilerState::Stopped);
    assert!(h.reconciler.registry().is_empty());
    assert_eq!(h.log.lock().unwrap().killed.len(), 2);
    assert!(!h.paths.ports_file().exists());
    assert!(!h.paths.tunnel_pids_file().exists());
}

#[tokio::test]
async fn test_shutdown_before_bootstrap() {
    let mut h = harness(
        FakeRuntime::default(),
        FakeSpawner::default(),
        FakeProbe::default(),
    );

    h.reconciler.shutdown();

    assert_eq!(h.reconciler.state(), ReconcilerState::Stopped);
    assert!(h.log.lock().unwrap().killed.is_empty());
}

#[tokio::test]
async fn test_drop_tears_down_tunnels() {
    let h = harness(
        FakeRuntime::with([web1()]),
        FakeSpawner::default(),
        FakeProbe::default(),
    );
    let Harness {
        mut reconciler,
        log,
        paths,
        _dir,
    } = h;
    reconciler.bootstrap().await.unwrap();
    assert!(paths.ports_file().exists());

    drop(reconciler);

    assert_eq!(log.lock().unwrap().killed.len(), 1);
    assert!(!paths.ports_file().exists());
}

/// Pid the fake tunnel client recorded on startup, waiting for it to be written.
async fn recorded_pid(path: &Path) -> u32 {
    for _ in 0..50 {
        if let Ok(content) = fs::read_to_string(path) {
            if let Ok(pid) = content.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("tunnel client never wrote {}", path.display());
}

#[tokio::test]
async fn test_shutdown_after_cancelled_run_kills_client_in_grace_period() {
    let dir = tempdir().unwrap();
    let paths = StatePaths::new(dir.path());
    let pid_path = dir.path().join("client.pid");
    let client = dir.path().join("fake-ssh");
    fs::write(
        &client,
        format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_path.display()),
    )
    .unwrap();
    fs::set_permissions(&client, fs::Permissions::from_mode(0o755)).unwrap();

    let options = SshOptions {
        binary: client,
        user: "docker".to_string(),
        host: Ipv4Addr::new(192, 168, 99, 100),
        identity_file: dir.path().join("id_rsa"),
        connect_timeout: Duration::from_secs(10),
        connection_attempts: 1,
        grace_period: Duration::from_secs(5),
        paths: paths.clone(),
    };
    let registry = TunnelRegistry::new(
        SshTunnelController::new(options),
        FakeProbe::default(),
        StateStore::new(&paths),
    );
    let mut reconciler = Reconciler::new(FakeRuntime::with([web1()]), registry);

    // Stands in for a termination signal arriving while 8080 is in its grace period.
    tokio::select! {
        _ = reconciler.run() => panic!("run finished during the grace period"),
        _ = tokio::time::sleep(Duration::from_millis(300)) => {}
    }
    let pid = recorded_pid(&pid_path).await;
    assert!(process_alive(pid));

    reconciler.shutdown();

    assert!(!process_alive(pid));
    assert!(!paths.tunnel_pids_file().exists());
}
