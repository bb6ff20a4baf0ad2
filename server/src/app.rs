//! Core application
//!
//! Wires the replica together: config, store, gateway, background tasks, and
//! graceful shutdown. The transport façade embedding this gateway supplies
//! the real ACL source; standalone runs fall back to permission-claim checks
//! (or permit-all when auth is disabled for development).

use std::sync::Arc;

use anyhow::Result;

use crate::core::cli::{self, CliConfig, Commands};
use crate::core::config::GatewayConfig;
use crate::core::constants::{APP_NAME, APP_NAME_LOWER, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::domain::acl::{AclSource, PermissionAclSource, PermitAllAclSource};
use crate::domain::gateway::EventGateway;

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub gateway: Arc<EventGateway>,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        match command {
            Some(Commands::Start) | None => {}
        }

        let app = Self::init(&cli_config).await?;
        Self::start_replica(app).await
    }

    async fn init(cli: &CliConfig) -> Result<Self> {
        let config = GatewayConfig::load(cli)?;

        let acl_source: Arc<dyn AclSource> = if config.allow_auth_disabled {
            tracing::warn!("Authentication disabled; every topic access is permitted");
            Arc::new(PermitAllAclSource)
        } else {
            Arc::new(PermissionAclSource)
        };

        tracing::info!(
            environment = %config.environment,
            store = %config.store.backend,
            prefix = %config.prefix,
            durability = config.durability_enabled,
            "{} gateway initializing",
            APP_NAME
        );

        let gateway = Arc::new(
            EventGateway::new(config, acl_source)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to initialize gateway: {}", e))?,
        );

        gateway
            .health_check()
            .await
            .map_err(|e| anyhow::anyhow!("Store health check failed: {}", e))?;
        tracing::debug!(backend = gateway.store().backend_name(), "Store connected");

        Ok(Self {
            shutdown: ShutdownService::new(),
            gateway,
        })
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_replica(app: Self) -> Result<()> {
        app.shutdown.install_signal_handlers();

        for handle in app.gateway.start_background_tasks() {
            app.shutdown.register(handle).await;
        }

        tracing::info!("Gateway replica running; press ctrl-c to stop");
        app.shutdown.wait().await;

        // Cancel subscriptions and the distributor before awaiting tasks
        app.gateway.trigger_shutdown();
        app.shutdown.shutdown().await;

        Ok(())
    }
}
