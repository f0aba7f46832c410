//! Wiring of the orchestrator subsystems.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fleetgrid_api::ApiState;
use fleetgrid_autoscale::Autoscaler;
use fleetgrid_control::{ControlServer, ControlSettings};
use fleetgrid_core::{FleetConfig, Thresholds};
use fleetgrid_health::{HealthMonitor, HealthThresholds, ReclaimFuture, ReclaimHandler};
use fleetgrid_lifecycle::{
    BackoffPolicy, ContainerRuntime, LifecycleController, LifecycleSettings, ReconcileReport,
};
use fleetgrid_routing::RoutingPublisher;
use fleetgrid_state::{GroupStore, Platform, Registry};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Every subsystem of a running orchestrator.
pub struct Fleet {
    pub registry: Registry,
    pub store: GroupStore,
    pub lifecycle: LifecycleController,
    pub health: Arc<HealthMonitor>,
    pub autoscaler: Autoscaler,
    pub routing: Arc<RoutingPublisher>,
    pub control: Arc<ControlServer>,
    health_interval: Duration,
    autoscale_interval: Duration,
}

/// Background loops started by [`Fleet::start`].
pub struct FleetTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl FleetTasks {
    /// Wait for every loop to exit.
    pub async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "background task failed");
            }
        }
    }
}

impl Fleet {
    /// Build the subsystems from `config`.
    ///
    /// Groups in `store` are loaded first. Config groups the store does
    /// not know yet are created and persisted; for groups present in
    /// both, the stored definition is kept.
    pub fn assemble(
        config: &FleetConfig,
        store: GroupStore,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let registry = Registry::new();
        // Subscribes before any instance exists.
        let routing = RoutingPublisher::new(registry.clone());
        load_groups(&registry, &store, config)?;

        let settings = LifecycleSettings {
            runtime_workers: config.lifecycle.runtime_workers,
            call_deadline: config.call_deadline()?,
            provision_attempts: config.lifecycle.provision_attempts,
            backoff: BackoffPolicy {
                first: config.retry_backoff()?,
                max: config.retry_backoff_max()?,
                factor: 2.0,
            },
            drain_grace: config.drain_grace()?,
            stop_timeout: config.stop_timeout()?,
        };
        let lifecycle = LifecycleController::new(registry.clone(), runtime, settings);

        let reclaimer = lifecycle.clone();
        let reclaim: ReclaimHandler = Arc::new(move |id| -> ReclaimFuture {
            let lifecycle = reclaimer.clone();
            Box::pin(async move {
                lifecycle
                    .reclaim(&id)
                    .await
                    .with_context(|| format!("reclaim {id}"))
            })
        });
        let mut health = HealthMonitor::new(registry.clone())
            .with_default_thresholds(health_thresholds(Thresholds::default()))
            .with_reclaim_handler(reclaim);
        for platform in Platform::ALL {
            health = health.with_platform_thresholds(
                platform,
                health_thresholds(config.thresholds(platform)?),
            );
        }
        let health = Arc::new(health);

        let autoscaler = Autoscaler::new(lifecycle.clone());

        let control = ControlServer::new(
            health.clone(),
            lifecycle.clone(),
            routing.clone(),
            ControlSettings {
                token: config.server.token.clone(),
                handshake_timeout: config.handshake_timeout()?,
                outbound_queue: config.server.outbound_queue,
            },
        );
        lifecycle.set_agent_channel(control.connections());

        Ok(Self {
            registry,
            store,
            lifecycle,
            health,
            autoscaler,
            routing,
            control,
            health_interval: config.health_interval()?,
            autoscale_interval: config.autoscaler_interval()?,
        })
    }

    /// State shared by the management API handlers.
    pub fn api_state(&self) -> ApiState {
        ApiState {
            registry: self.registry.clone(),
            store: self.store.clone(),
            lifecycle: self.lifecycle.clone(),
            autoscaler: self.autoscaler.clone(),
        }
    }

    /// Rebuild instances from containers that survived a restart.
    pub async fn reconcile(&self) -> anyhow::Result<ReconcileReport> {
        let report = self
            .lifecycle
            .reconcile()
            .await
            .context("startup reconciliation")?;
        info!(
            adopted = report.adopted.len(),
            removed = report.removed.len(),
            "startup reconciliation complete"
        );
        Ok(report)
    }

    /// Start the health, autoscaler, and control server loops.
    pub fn start(&self, control: TcpListener, shutdown: watch::Receiver<bool>) -> FleetTasks {
        let mut handles = Vec::with_capacity(3);

        let health = self.health.clone();
        let interval = self.health_interval;
        let rx = shutdown.clone();
        handles.push((
            "health",
            tokio::spawn(async move { health.run(interval, rx).await }),
        ));

        let autoscaler = self.autoscaler.clone();
        let interval = self.autoscale_interval;
        let rx = shutdown.clone();
        handles.push((
            "autoscaler",
            tokio::spawn(async move { autoscaler.run(interval, rx).await }),
        ));

        let server = self.control.clone();
        handles.push((
            "control",
            tokio::spawn(async move {
                if let Err(e) = server.serve(control, shutdown).await {
                    warn!(error = %e, "control server stopped with error");
                }
            }),
        ));

        info!(
            health_interval = ?self.health_interval,
            autoscale_interval = ?self.autoscale_interval,
            "background tasks started"
        );
        FleetTasks { handles }
    }
}

fn load_groups(registry: &Registry, store: &GroupStore, config: &FleetConfig) -> anyhow::Result<()> {
    for spec in store.list_groups().context("load persisted groups")? {
        let name = spec.name.clone();
        match registry.create_group(spec) {
            Ok(_) => debug!(group = %name, "group loaded from store"),
            Err(e) => warn!(group = %name, error = %e, "skipping persisted group"),
        }
    }

    for spec in &config.groups {
        if registry.group(&spec.name).is_some() {
            debug!(group = %spec.name, "stored definition takes precedence over config");
            continue;
        }
        registry
            .create_group(spec.clone())
            .with_context(|| format!("create group {}", spec.name))?;
        store
            .put_group(spec)
            .with_context(|| format!("persist group {}", spec.name))?;
        info!(group = %spec.name, platform = spec.platform.as_str(), "group created from config");
    }
    Ok(())
}

fn health_thresholds(t: Thresholds) -> HealthThresholds {
    HealthThresholds {
        missed_after: t.missed_after,
        startup_timeout: t.startup_timeout,
        reclaim_after: t.reclaim_after,
    }
}
