#![allow(dead_code)]

use std::path::PathBuf;

use cellrunner::config::{ConfigFile, RawConfigFile};
use cellrunner::engine::{
    self, Coordinator, CoordinatorHandle, CoordinatorState, KernelSpec, Runtime, RuntimeOptions,
};
use cellrunner::stream::StreamSettings;
use cellrunner::types::RestartQueuePolicy;
use tokio::task::JoinHandle;

use crate::fake_kernel::FakeKernel;
use crate::recording_sink::{RecordingObserver, RecordingSink};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn kernel(mut self, name: &str) -> Self {
        self.config.kernel.name = name.to_string();
        self
    }

    pub fn bridge(mut self, python: &str, bridge: impl Into<PathBuf>) -> Self {
        self.config.kernel.python = python.to_string();
        self.config.kernel.bridge = bridge.into();
        self
    }

    pub fn bulk_threshold(mut self, events: u32) -> Self {
        self.config.stream.bulk_threshold = events;
        self
    }

    pub fn batch(mut self, max_lines: usize, max_latency_ms: u64) -> Self {
        self.config.stream.batch_max_lines = max_lines;
        self.config.stream.batch_max_latency_ms = max_latency_ms;
        self
    }

    pub fn restart_queue(mut self, policy: RestartQueuePolicy) -> Self {
        self.config.coordinator.restart_queue = policy;
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A runtime wired to a [`FakeKernel`] and a [`RecordingSink`].
pub struct Harness {
    pub handle: CoordinatorHandle,
    pub kernel: FakeKernel,
    pub sink: RecordingSink,
    pub observer: RecordingObserver,
    pub task: JoinHandle<cellrunner::errors::Result<()>>,
}

impl Harness {
    pub fn builder(kernel: FakeKernel) -> HarnessBuilder {
        HarnessBuilder::new(kernel)
    }

    /// Default settings: `python3` kernel, drained queue on restart.
    pub fn spawn(kernel: FakeKernel) -> Self {
        HarnessBuilder::new(kernel).spawn()
    }

    /// Poll snapshots until the coordinator reaches `state`.
    pub async fn wait_for_state(&self, state: CoordinatorState) {
        crate::with_timeout(async {
            loop {
                let snapshot = self.handle.snapshot().await.expect("runtime stopped");
                if snapshot.state == state {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
        })
        .await;
    }

    /// Stop the runtime and wait for its loop to end.
    pub async fn stop(self) -> cellrunner::errors::Result<()> {
        let _ = self.handle.stop().await;
        self.join().await
    }

    pub async fn join(self) -> cellrunner::errors::Result<()> {
        crate::with_timeout(self.task)
            .await
            .expect("runtime task panicked")
    }
}

pub struct HarnessBuilder {
    kernel: FakeKernel,
    spec: KernelSpec,
    policy: RestartQueuePolicy,
    options: RuntimeOptions,
    settings: StreamSettings,
}

impl HarnessBuilder {
    pub fn new(kernel: FakeKernel) -> Self {
        Self {
            kernel,
            spec: KernelSpec::new("python3"),
            policy: RestartQueuePolicy::default(),
            options: RuntimeOptions::default(),
            settings: StreamSettings::default(),
        }
    }

    pub fn spec(mut self, spec: KernelSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn restart_queue(mut self, policy: RestartQueuePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn exit_when_idle(mut self) -> Self {
        self.options.exit_when_idle = true;
        self
    }

    pub fn settings(mut self, settings: StreamSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn spawn(self) -> Harness {
        let sink = RecordingSink::new();
        let observer = RecordingObserver::new();
        let core = Coordinator::new(self.spec, self.policy, self.options);
        let (handle, rx) = engine::channel(engine::handle::DEFAULT_CHANNEL_CAPACITY);
        let runtime = Runtime::new(core, rx, self.kernel.launcher(), sink.clone(), self.settings)
            .with_observer(observer.clone());
        let task = tokio::spawn(runtime.run());

        Harness {
            handle,
            kernel: self.kernel,
            sink,
            observer,
            task,
        }
    }
}
