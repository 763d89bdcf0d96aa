// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Agent runtime: control channel, dispatcher, handler registry and the
//! one-shot handlers.

mod channel;
mod dispatcher;
pub mod handlers;
pub(crate) mod registry;
mod reporter;
pub(crate) mod session;
mod shutdown;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::core::{AgentConfig, Result};

pub use channel::{Backoff, ControlChannel};
pub use dispatcher::{Dispatcher, PlannedSession, ReconcileSummary, SessionKey, plan_sessions};
pub use registry::{HandlerRegistry, MeasureRequest, Measurement, ProbeHandler};
pub use reporter::ResultReporter;
pub use session::{DiagnosticIntent, SessionContext};
pub use shutdown::{ShutdownSignal, ShutdownTrigger, shutdown_channel};

const PROBE_SET_QUEUE: usize = 4;

/// One agent process: wires the result queue, the control channel and the
/// dispatcher together.
pub struct Agent {
    config: Arc<AgentConfig>,
    registry: Arc<HandlerRegistry>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let registry = Arc::new(HandlerRegistry::with_defaults(&config));
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: AgentConfig, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run until `shutdown` fires. Sessions are stopped first so their final
    /// reports can still be written before the channel closes.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        self.config.validate()?;
        tracing::info!(
            "[Agent] Agent {} starting (handlers: {:?})",
            self.config.agent_id,
            self.registry.registered_types()
        );

        let (reporter, results_rx) = ResultReporter::channel(self.config.result_queue_capacity);
        let (probes_tx, probes_rx) = mpsc::channel(PROBE_SET_QUEUE);
        let (channel_trigger, channel_signal) = shutdown_channel();

        let channel = ControlChannel::new(self.config.clone());
        let channel_task = tokio::spawn(channel.run(results_rx, probes_tx, channel_signal));

        let dispatcher = Dispatcher::new(
            self.config.agent_id,
            self.config.clone(),
            self.registry.clone(),
            reporter,
        );
        let (dispatcher_trigger, dispatcher_signal) = shutdown_channel();
        let dispatcher_task = tokio::spawn(dispatcher.run(probes_rx, dispatcher_signal));

        shutdown.wait().await;
        tracing::info!("[Agent] Shutting down");

        dispatcher_trigger.trigger();
        if let Err(e) = dispatcher_task.await {
            tracing::error!("[Agent] Dispatcher task failed: {}", e);
        }
        channel_trigger.trigger();
        if tokio::time::timeout(self.config.graceful_shutdown(), channel_task)
            .await
            .is_err()
        {
            tracing::warn!("[Agent] Control channel did not close in time");
        }
        tracing::info!("[Agent] Stopped");
        Ok(())
    }
}
