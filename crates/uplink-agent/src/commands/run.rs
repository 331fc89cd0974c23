//! Run command - start the agent

use crate::handlers::{self, AppState};
use crate::logging;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uplink_core::credentials::{load_shadow_file, SessionTokenSource, ShadowFileSource};
use uplink_core::memory::SystemMemory;
use uplink_core::persistence::FolderStore;
use uplink_core::settings::CredentialSourceKind;
use uplink_core::{
    ActivityLogger, AgentSettings, BucketRouter, CredentialBroker, CredentialSource, RemoteStore,
    S3Store, Supervisor, SupervisorDeps, SupervisorSettings, UploadClient,
};

pub async fn execute(config: Option<&Path>, verbose: bool) -> Result<()> {
    let settings = AgentSettings::load(config).context("Failed to load configuration")?;
    let _log_guard = logging::init(&settings.log_file, verbose)?;

    info!("Starting Uplink agent v{}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let initial = load_shadow_file(&settings.shadow_file)
        .context("Failed to load initial credentials")?;
    let source: Arc<dyn CredentialSource> = match settings.credential_source {
        CredentialSourceKind::ShadowFile => Arc::new(ShadowFileSource::new(
            settings.shadow_file.clone(),
            settings.settle_delay(),
        )),
        CredentialSourceKind::SessionToken => Arc::new(SessionTokenSource::new(
            settings.session_command.clone(),
            Duration::from_secs(settings.session_duration_secs),
        )),
    };
    let broker = Arc::new(CredentialBroker::new(
        initial,
        source,
        settings.recovery_cache_path(),
    ));

    let store: Arc<dyn RemoteStore> = Arc::new(S3Store::new(
        settings.region.clone(),
        settings.endpoint.clone(),
    ));
    let activity = Arc::new(
        ActivityLogger::new(&settings.activity_log_dir).with_context(|| {
            format!(
                "Failed to prepare activity log directory: {}",
                settings.activity_log_dir.display()
            )
        })?,
    );
    let uploader = Arc::new(UploadClient::new(
        store.clone(),
        broker.clone(),
        activity,
        BucketRouter::from_settings(&settings),
        settings.auth_attempts,
    ));

    let folder_store = FolderStore::open(&settings.database_path())
        .await
        .context("Failed to open folder database")?;

    let supervisor = Arc::new(
        Supervisor::start(
            SupervisorSettings::from_settings(&settings),
            SupervisorDeps {
                uploader,
                probe: Arc::new(SystemMemory::new()),
                folder_store,
            },
        )
        .await
        .context("Failed to start workers")?,
    );

    let addr: SocketAddr = settings
        .bind_address
        .parse()
        .context("Failed to parse bind address")?;

    let state = AppState {
        supervisor: supervisor.clone(),
        store,
        broker,
        settings: Arc::new(settings),
    };
    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Control surface listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    supervisor.shutdown().await;
    info!("Uplink agent stopped");

    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal. Initiating graceful shutdown.");
}
