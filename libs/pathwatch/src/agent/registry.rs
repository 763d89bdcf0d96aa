// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::core::{AgentConfig, ProbeType, Result};
use crate::trafficsim::TrafficSimHandler;

use super::handlers::{MtrMeasurement, PingMeasurement, ScheduledHandler};
use super::session::SessionContext;

/// Starts sessions for one probe type.
pub trait ProbeHandler: Send + Sync {
    fn spawn(&self, ctx: SessionContext) -> JoinHandle<()>;
}

/// Parameters for a single one-shot measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureRequest {
    /// Host without port.
    pub host: String,
    pub count: u32,
    /// Per-reply wait.
    pub timeout: Duration,
}

/// A single measurement producing a JSON payload.
pub trait Measurement: Send + Sync {
    fn measure(&self, request: MeasureRequest) -> BoxFuture<'static, Result<serde_json::Value>>;
}

/// Handlers registered per probe type at startup.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<ProbeType, Arc<dyn ProbeHandler>>>,
    diagnostic: RwLock<Option<Arc<dyn Measurement>>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            diagnostic: RwLock::new(None),
        }
    }

    /// PING, MTR and TRAFFICSIM handlers plus MTR as the triggered diagnostic.
    pub fn with_defaults(config: &AgentConfig) -> Self {
        let registry = Self::new();
        let max_runtime = Duration::from_secs(config.diagnostics.max_runtime_secs.max(1));

        let ping: Arc<dyn Measurement> = Arc::new(PingMeasurement::new(
            &config.diagnostics.ping_binary,
            max_runtime,
        ));
        let mtr: Arc<dyn Measurement> = Arc::new(MtrMeasurement::new(
            &config.diagnostics.mtr_binary,
            max_runtime,
        ));

        registry.register(
            ProbeType::Ping,
            Arc::new(ScheduledHandler::new(ProbeType::Ping, ping, 5)),
        );
        registry.register(
            ProbeType::Mtr,
            Arc::new(ScheduledHandler::new(ProbeType::Mtr, mtr.clone(), 5)),
        );
        registry.register(ProbeType::TrafficSim, Arc::new(TrafficSimHandler::new()));
        registry.set_diagnostic(mtr);
        registry
    }

    /// Register a handler. Replacing an existing one logs a warning.
    pub fn register(&self, probe_type: ProbeType, handler: Arc<dyn ProbeHandler>) {
        if self
            .handlers
            .write()
            .insert(probe_type, handler)
            .is_some()
        {
            tracing::warn!("[Registry] Replaced handler for {}", probe_type);
        } else {
            tracing::debug!("[Registry] Registered handler for {}", probe_type);
        }
    }

    pub fn get(&self, probe_type: ProbeType) -> Option<Arc<dyn ProbeHandler>> {
        self.handlers.read().get(&probe_type).cloned()
    }

    pub fn set_diagnostic(&self, measurement: Arc<dyn Measurement>) {
        *self.diagnostic.write() = Some(measurement);
    }

    pub fn diagnostic(&self) -> Option<Arc<dyn Measurement>> {
        self.diagnostic.read().clone()
    }

    pub fn registered_types(&self) -> Vec<ProbeType> {
        let mut types: Vec<_> = self.handlers.read().keys().copied().collect();
        types.sort();
        types
    }
}
