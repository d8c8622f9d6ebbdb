//! Patch-set rollout through the real dashboard and kernel sources.
//!
//! Build commands are scripted; the image script hook drops the files a real
//! build would produce. The worker is a plain `sleep`.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fuzzdeploy_agent::cloud::fake::{ImageCall, MemoryBlobStore, RecordingImageService};
use fuzzdeploy_agent::cloud::ImagePublisher;
use fuzzdeploy_agent::dashboard::{DashboardError, Patch, PatchDashboard};
use fuzzdeploy_agent::exec::{CommandError, CommandRunner, CommandSpec, ScriptedRunner};
use fuzzdeploy_agent::layout::WorkspaceLayout;
use fuzzdeploy_agent::sources::{KernelSource, PatchSetSource};
use fuzzdeploy_agent::{
    ChangeSource, Config, ControlEvent, ManagerLauncher, ProcessSupervisor, Updater,
    UpdaterConfig, UpdaterError, WorkerLauncher, WorkerPort, WorkerSpec,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct BuildRunner {
    inner: ScriptedRunner,
    workspace: WorkspaceLayout,
}

#[async_trait]
impl CommandRunner for BuildRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<Vec<u8>, CommandError> {
        let output = self.inner.run(spec).await?;
        if spec.program.ends_with("create-gce-image.sh") {
            let build = self.workspace.build_dir();
            std::fs::create_dir_all(self.workspace.linux_dir()).unwrap();
            std::fs::write(self.workspace.linux_dir().join("vmlinux"), "elf").unwrap();
            std::fs::write(build.join("key"), "ssh-key").unwrap();
            std::fs::write(build.join("disk.tar.gz"), "disk").unwrap();
        }
        Ok(output)
    }
}

#[derive(Default)]
struct FakeDashboard {
    state: Mutex<(String, Vec<Patch>)>,
}

impl FakeDashboard {
    fn publish(&self, hash: &str, patches: Vec<Patch>) {
        *self.state.lock().unwrap() = (hash.to_string(), patches);
    }
}

#[async_trait]
impl PatchDashboard for FakeDashboard {
    async fn poll_patches(&self) -> Result<String, DashboardError> {
        Ok(self.state.lock().unwrap().0.clone())
    }

    async fn get_patches(&self) -> Result<Vec<Patch>, DashboardError> {
        Ok(self.state.lock().unwrap().1.clone())
    }
}

/// Manager launcher with the binary swapped for `sleep`.
struct SleepingManager(ManagerLauncher);

#[async_trait]
impl WorkerLauncher for SleepingManager {
    async fn prepare(&self, port: u16) -> io::Result<WorkerSpec> {
        let spec = self.0.prepare(port).await?;
        Ok(WorkerSpec {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            ..spec
        })
    }
}

fn local_config() -> Config {
    Config::from_slice(
        br#"{
            "name": "ci-upstream",
            "image_archive": "local",
            "image_path": "bucket/disk.tar.gz",
            "image_name": "ci-upstream-image",
            "http_port": 10000,
            "machine_type": "n1-standard-2",
            "machine_count": 2,
            "linux_git": "https://git.example/linux.git",
            "linux_branch": "master",
            "linux_compiler": "gcc",
            "linux_userspace": "wheezy",
            "dashboard_addr": "https://dashboard.example"
        }"#,
    )
    .unwrap()
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A running update loop over the dashboard and kernel sources.
struct Rollout {
    _dir: tempfile::TempDir,
    workspace: WorkspaceLayout,
    runner: Arc<BuildRunner>,
    images: Arc<RecordingImageService>,
    dashboard: Arc<FakeDashboard>,
    port: WorkerPort,
    events: mpsc::Sender<ControlEvent>,
    handle: JoinHandle<Result<(), UpdaterError>>,
}

impl Rollout {
    /// Start the loop; `before_start` runs once the collaborators exist.
    fn start(before_start: impl FnOnce(&RecordingImageService)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workspace = WorkspaceLayout::new(dir.path());
        std::fs::create_dir_all(workspace.build_dir()).unwrap();
        let config = local_config();

        let inner = ScriptedRunner::new();
        inner.respond("git log", "abc123");
        let runner = Arc::new(BuildRunner {
            inner,
            workspace: workspace.clone(),
        });
        let images = Arc::new(RecordingImageService::new());
        before_start(&images);
        let publisher = ImagePublisher::new(
            Arc::new(MemoryBlobStore::new()),
            images.clone(),
            config.image_path.clone(),
            config.image_name.clone(),
        );
        let dashboard = Arc::new(FakeDashboard::default());

        let kernel = KernelSource::new(runner.clone(), publisher, workspace.clone(), &config);
        let sources = vec![
            Box::new(PatchSetSource::new(dashboard.clone())) as Box<dyn ChangeSource>,
            Box::new(kernel) as Box<dyn ChangeSource>,
        ];
        let timings = UpdaterConfig {
            error_delay: Duration::from_millis(50),
            idle_delay: Duration::from_millis(50),
            stop_poll_delay: Duration::from_millis(100),
            healthy_delay: Duration::from_millis(50),
            min_uptime: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(2),
        };
        let port = WorkerPort::new();
        let (events, rx) = mpsc::channel(4);
        let updater = Updater::new(
            sources,
            ProcessSupervisor::new(port.clone(), timings.min_uptime),
            Arc::new(SleepingManager(ManagerLauncher::new(config, workspace.clone()))),
            rx,
            timings,
        );
        Self {
            _dir: dir,
            workspace,
            runner,
            images,
            dashboard,
            port,
            events,
            handle: tokio::spawn(updater.run()),
        }
    }

    fn creates(&self) -> usize {
        self.images
            .calls()
            .iter()
            .filter(|c| matches!(c, ImageCall::Create { .. }))
            .count()
    }

    fn commands_starting_with(&self, prefix: &str) -> usize {
        self.runner
            .inner
            .commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    async fn shutdown(self) {
        self.events.send(ControlEvent::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_new_patch_set_rebuilds_same_kernel_revision() {
    let r = Rollout::start(|_| {});

    wait_until("first deployment", || r.creates() == 1 && r.port.get() != 0).await;
    let first_port = r.port.get();
    let manager_cfg = std::fs::read_to_string(r.workspace.manager_config()).unwrap();
    assert!(manager_cfg.contains(&format!("\":{first_port}\"")));
    assert_eq!(r.commands_starting_with("patch"), 0);

    r.dashboard.publish(
        "p7",
        vec![Patch {
            title: "net: fix refcount leak".to_string(),
            diff: b"--- a/net/core.c\n+++ b/net/core.c\n".to_vec(),
        }],
    );
    wait_until("patched deployment", || r.creates() == 2 && r.port.get() != 0).await;

    assert_eq!(r.workspace.artifacts().read_tag().unwrap(), "abc123");
    assert!(r
        .runner
        .inner
        .commands()
        .iter()
        .any(|c| c == "patch -p1 --force --ignore-whitespace"));
    assert_eq!(r.commands_starting_with("make -j"), 2);
    let manager_cfg = std::fs::read_to_string(r.workspace.manager_config()).unwrap();
    assert!(manager_cfg.contains(&format!("\":{}\"", r.port.get())));
    assert!(manager_cfg.contains("\"tag\": \"abc123\""));

    r.shutdown().await;
}

#[tokio::test]
async fn test_failed_publish_is_rebuilt_before_start() {
    let r = Rollout::start(|images| images.fail_next_create("quota exceeded"));

    wait_until("deployment after retry", || r.port.get() != 0).await;

    // The first kernel build was never committed, so it ran again.
    assert_eq!(r.creates(), 2);
    assert_eq!(r.commands_starting_with("make -j"), 2);
    assert_eq!(r.workspace.artifacts().read_tag().unwrap(), "abc123");

    // Once committed, idle polls do not rebuild.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(r.creates(), 2);
    assert_eq!(r.commands_starting_with("make -j"), 2);

    r.shutdown().await;
}
