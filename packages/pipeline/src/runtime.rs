//! Worker process lifecycle.
//!
//! # Architecture
//!
//! ```text
//! CONFIGURING ──► CONNECTING ──► RUNNING ──► DRAINING ──► STOPPED
//!      │               │            │            │
//!      └───────────────┴────────────┴────────────┴──────► FAILED
//! ```
//!
//! - CONFIGURING runs [`Stage::validate`] before any connection attempt.
//! - CONNECTING retries the [`ChannelConnector`] with bounded backoff.
//! - RUNNING starts after [`Stage::setup`] and the readiness announcement.
//! - DRAINING begins when the shutdown token fires. The stage sees the same
//!   token and decides where to stop; a finalize in progress is never
//!   interrupted.
//!
//! The current state is published on a `tokio::sync::watch` channel.
//!
//! # Example
//!
//! ```ignore
//! let runtime = WorkerRuntime::with_config(Arc::new(NatsConnector::new(settings)), config);
//! runtime.run_until_shutdown(BatchConsumer::new(stage, consumer_config)).await?;
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::channel::{readiness_subject, ChannelConnector, MessageChannel};
use crate::error::{PipelineError, Result};

/// Observable lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Configuring,
    Connecting,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl RuntimeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RuntimeState::Stopped | RuntimeState::Failed)
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeState::Configuring => "CONFIGURING",
            RuntimeState::Connecting => "CONNECTING",
            RuntimeState::Running => "RUNNING",
            RuntimeState::Draining => "DRAINING",
            RuntimeState::Stopped => "STOPPED",
            RuntimeState::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

/// What a running stage gets from the runtime.
pub struct StageContext {
    pub channel: Arc<dyn MessageChannel>,
    pub shutdown: CancellationToken,
    pub worker_id: String,
    state: Arc<watch::Sender<RuntimeState>>,
}

impl StageContext {
    /// Context outside a runtime, for driving a stage directly.
    pub fn new(channel: Arc<dyn MessageChannel>, shutdown: CancellationToken) -> Self {
        let (state, _) = watch::channel(RuntimeState::Running);
        Self {
            channel,
            shutdown,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A stage's main loop, driven by [`WorkerRuntime`].
#[async_trait]
pub trait Stage: Send {
    /// Stage name; used for logs and the readiness subject.
    fn name(&self) -> &str;

    /// Check options. Runs before any connection attempt.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// One-time setup once connected (e.g. making sure an index exists).
    async fn setup(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Main loop. Returning `Ok` stops the worker cleanly.
    async fn run(&mut self, ctx: &StageContext) -> Result<()>;
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Subject prefix for readiness signals.
    pub prefix: String,
    pub worker_id: String,
    pub connect_backoff: Backoff,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            prefix: "pipeline".to_string(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
            connect_backoff: Backoff::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Runs one stage through the worker lifecycle.
pub struct WorkerRuntime {
    connector: Arc<dyn ChannelConnector>,
    config: RuntimeConfig,
    state: Arc<watch::Sender<RuntimeState>>,
    shutdown: CancellationToken,
}

impl WorkerRuntime {
    pub fn new(connector: Arc<dyn ChannelConnector>) -> Self {
        Self::with_config(connector, RuntimeConfig::default())
    }

    pub fn with_config(connector: Arc<dyn ChannelConnector>, config: RuntimeConfig) -> Self {
        let (state, _) = watch::channel(RuntimeState::Configuring);
        Self {
            connector,
            config,
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that starts draining when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    fn set_state(&self, next: RuntimeState) {
        self.state.send_replace(next);
    }

    /// Run `stage` to completion and leave the runtime STOPPED or FAILED.
    pub async fn run<S: Stage>(&self, mut stage: S) -> Result<()> {
        let stage_name = stage.name().to_string();
        let result = match self.drive(&mut stage).await {
            // A wait abandoned because of shutdown is a clean stop.
            Err(PipelineError::Cancelled) if self.shutdown.is_cancelled() => {
                info!(stage = %stage_name, "stage cancelled by shutdown");
                Ok(())
            }
            other => other,
        };

        match &result {
            Ok(()) => {
                self.set_state(RuntimeState::Stopped);
                info!(stage = %stage_name, worker_id = %self.config.worker_id, "worker stopped");
            }
            Err(e) => {
                self.set_state(RuntimeState::Failed);
                error!(
                    stage = %stage_name,
                    worker_id = %self.config.worker_id,
                    class = %e.class(),
                    error = %e,
                    "worker failed"
                );
            }
        }

        result
    }

    /// Like [`WorkerRuntime::run`], draining on Ctrl-C.
    pub async fn run_until_shutdown<S: Stage>(&self, stage: S) -> Result<()> {
        let token = self.shutdown.clone();
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl-C, shutting down");
                token.cancel();
            }
        });

        let result = self.run(stage).await;
        signal.abort();
        result
    }

    async fn drive<S: Stage>(&self, stage: &mut S) -> Result<()> {
        self.set_state(RuntimeState::Configuring);
        stage.validate()?;

        self.set_state(RuntimeState::Connecting);
        let channel = self
            .config
            .connect_backoff
            .retry("connect", || self.connector.connect())
            .await
            .map_err(|(attempts, source)| {
                if source.is_connection() {
                    PipelineError::Connection { attempts, source }
                } else {
                    PipelineError::Channel(source)
                }
            })?;

        let ctx = StageContext {
            channel: channel.clone(),
            shutdown: self.shutdown.clone(),
            worker_id: self.config.worker_id.clone(),
            state: self.state.clone(),
        };

        let outcome = self.serve(stage, &ctx).await;

        if let Err(e) = channel.close().await {
            warn!(error = %e, "failed to close channel cleanly");
        }

        outcome
    }

    async fn serve<S: Stage>(&self, stage: &mut S, ctx: &StageContext) -> Result<()> {
        let name = stage.name().to_string();
        stage.setup(ctx).await?;
        self.announce(&name, ctx).await;

        self.set_state(RuntimeState::Running);
        info!(stage = %name, worker_id = %ctx.worker_id, "worker running");

        let watcher = {
            let state = self.state.clone();
            let token = self.shutdown.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                enter_draining(&state);
            })
        };

        let result = stage.run(ctx).await;
        watcher.abort();

        if self.shutdown.is_cancelled() {
            enter_draining(&self.state);
        }

        result
    }

    async fn announce(&self, stage: &str, ctx: &StageContext) {
        let subject = readiness_subject(&self.config.prefix, stage);
        let payload = serde_json::json!({
            "stage": stage,
            "worker_id": ctx.worker_id,
            "ready_at": Utc::now(),
        })
        .to_string();

        match ctx.channel.announce(&subject, &payload).await {
            Ok(()) => info!(subject = %subject, "announced readiness"),
            Err(e) => warn!(subject = %subject, error = %e, "failed to announce readiness"),
        }
    }
}

fn enter_draining(state: &watch::Sender<RuntimeState>) {
    let changed = state.send_if_modified(|current| {
        if *current == RuntimeState::Running {
            *current = RuntimeState::Draining;
            true
        } else {
            false
        }
    });
    if changed {
        info!("shutdown requested, draining");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryChannel, MemoryConnector};
    use crate::error::ChannelError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct TestStage {
        valid: bool,
        ran: Arc<AtomicBool>,
        wait_for_shutdown: bool,
        cancel_on_shutdown: bool,
        saw_draining: Arc<AtomicBool>,
    }

    impl TestStage {
        fn new() -> Self {
            Self {
                valid: true,
                ran: Arc::new(AtomicBool::new(false)),
                wait_for_shutdown: false,
                cancel_on_shutdown: false,
                saw_draining: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Stage for TestStage {
        fn name(&self) -> &str {
            "sample"
        }

        fn validate(&self) -> Result<()> {
            if self.valid {
                Ok(())
            } else {
                Err(PipelineError::configuration("missing --date"))
            }
        }

        async fn run(&mut self, ctx: &StageContext) -> Result<()> {
            assert_eq!(ctx.state(), RuntimeState::Running);
            self.ran.store(true, Ordering::SeqCst);

            if self.cancel_on_shutdown {
                ctx.shutdown.cancelled().await;
                return Err(PipelineError::Cancelled);
            }

            if self.wait_for_shutdown {
                ctx.shutdown.cancelled().await;
                let drained = tokio::time::timeout(Duration::from_secs(1), async {
                    while ctx.state() != RuntimeState::Draining {
                        tokio::task::yield_now().await;
                    }
                })
                .await;
                self.saw_draining.store(drained.is_ok(), Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            connect_backoff: Backoff {
                initial: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                max_attempts: 3,
            },
            ..RuntimeConfig::with_worker_id("test-worker")
        }
    }

    #[tokio::test]
    async fn test_runs_stage_and_announces_readiness() {
        let channel = MemoryChannel::new();
        let runtime = WorkerRuntime::with_config(
            Arc::new(MemoryConnector::new(channel.clone())),
            fast_config(),
        );
        let stage = TestStage::new();
        let ran = stage.ran.clone();

        runtime.run(stage).await.unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(runtime.state(), RuntimeState::Stopped);
        assert_eq!(channel.close_calls(), 1);

        let announcements = channel.announcements();
        assert_eq!(announcements.len(), 1);
        assert_eq!(announcements[0].queue, "pipeline.ready.sample");
        assert!(announcements[0].payload.contains("test-worker"));
    }

    #[tokio::test]
    async fn test_invalid_options_fail_before_connecting() {
        let connector = Arc::new(MemoryConnector::new(MemoryChannel::new()));
        let runtime = WorkerRuntime::with_config(connector.clone(), fast_config());
        let stage = TestStage {
            valid: false,
            ..TestStage::new()
        };

        let err = runtime.run(stage).await.unwrap_err();

        assert!(matches!(err, PipelineError::Configuration(_)));
        assert_eq!(connector.attempts(), 0);
        assert_eq!(runtime.state(), RuntimeState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_then_succeeds() {
        let connector = Arc::new(MemoryConnector::new(MemoryChannel::new()).failing_first(2));
        let runtime = WorkerRuntime::with_config(connector.clone(), fast_config());

        runtime.run(TestStage::new()).await.unwrap();

        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up() {
        let channel = MemoryChannel::new();
        let connector = Arc::new(MemoryConnector::new(channel.clone()).failing_first(10));
        let runtime = WorkerRuntime::with_config(connector.clone(), fast_config());
        let stage = TestStage::new();
        let ran = stage.ran.clone();

        let err = runtime.run(stage).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Connection {
                attempts: 3,
                source: ChannelError::Connection(_)
            }
        ));
        assert_eq!(err.class().exit_code(), 3);
        assert!(!ran.load(Ordering::SeqCst));
        assert!(channel.announcements().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_moves_through_draining() {
        let runtime = Arc::new(WorkerRuntime::with_config(
            Arc::new(MemoryConnector::new(MemoryChannel::new())),
            fast_config(),
        ));
        let stage = TestStage {
            wait_for_shutdown: true,
            ..TestStage::new()
        };
        let saw_draining = stage.saw_draining.clone();
        let mut states = runtime.subscribe();

        let handle = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.run(stage).await })
        };

        states
            .wait_for(|state| *state == RuntimeState::Running)
            .await
            .unwrap();
        runtime.shutdown_token().cancel();

        handle.await.unwrap().unwrap();
        assert!(saw_draining.load(Ordering::SeqCst));
        assert_eq!(runtime.state(), RuntimeState::Stopped);
    }

    #[tokio::test]
    async fn test_wait_cancelled_by_shutdown_stops_cleanly() {
        let runtime = Arc::new(WorkerRuntime::with_config(
            Arc::new(MemoryConnector::new(MemoryChannel::new())),
            fast_config(),
        ));
        let stage = TestStage {
            cancel_on_shutdown: true,
            ..TestStage::new()
        };
        let mut states = runtime.subscribe();

        let handle = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.run(stage).await })
        };

        states
            .wait_for(|state| *state == RuntimeState::Running)
            .await
            .unwrap();
        runtime.shutdown_token().cancel();

        handle.await.unwrap().unwrap();
        assert_eq!(runtime.state(), RuntimeState::Stopped);
    }

    #[tokio::test]
    async fn test_cancelled_without_shutdown_is_a_failure() {
        struct GivesUp;

        #[async_trait]
        impl Stage for GivesUp {
            fn name(&self) -> &str {
                "sample"
            }

            async fn run(&mut self, _ctx: &StageContext) -> Result<()> {
                Err(PipelineError::Cancelled)
            }
        }

        let runtime = WorkerRuntime::with_config(
            Arc::new(MemoryConnector::new(MemoryChannel::new())),
            fast_config(),
        );
        let err = runtime.run(GivesUp).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(runtime.state(), RuntimeState::Failed);
    }
}
