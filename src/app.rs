//! Process wiring: builds the scheduler stack from a configuration document
//! and a set of external collaborators, then runs everything until shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, Server, ServerTlsConfig};

use crate::clock::{Clock, SystemClock};
use crate::config::{LeaderMode, SchedulerConfig};
use crate::error::{Result, SchedulerError};
use crate::executorapi::ExecutorApiService;
use crate::jobdb::JobDb;
use crate::leader::{
    LeaderController, LeaseApi, LeaseLeaderController, StandaloneLeaderController,
};
use crate::proto::executor_api_server::ExecutorApiServer;
use crate::publisher::{BusPublisher, EventSink};
use crate::repository::{InMemoryExecutorRepository, JobRepository};
use crate::scheduler::{FeasibilityChecker, LeastLoadedAlgo, Scheduler};

/// The collaborators a deployment has to provide: the durable job repository,
/// the event bus, and (in lease mode) the coordination service.
pub struct Collaborators {
    pub job_repository: Arc<dyn JobRepository>,
    pub event_sink: Arc<dyn EventSink>,
    pub lease_api: Option<Arc<dyn LeaseApi>>,
}

/// Run the scheduler until the shutdown token fires.
pub async fn run(
    config: SchedulerConfig,
    collaborators: Collaborators,
    shutdown: CancellationToken,
) -> Result<()> {
    config.validate()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let jobdb = JobDb::new(
        config.priority_classes.clone(),
        config.default_priority_class.clone(),
        config.interned_strings_cache_size,
    );
    let executor_repository = Arc::new(InMemoryExecutorRepository::new());
    let publisher = Arc::new(BusPublisher::new(
        Arc::clone(&collaborators.event_sink),
        config.max_event_message_bytes,
    ));

    let leader_controller: Arc<dyn LeaderController> = match config.leader_mode {
        LeaderMode::Standalone => {
            tracing::info!("scheduler will run in standalone mode");
            Arc::new(StandaloneLeaderController::new())
        }
        LeaderMode::Lease => {
            tracing::info!("scheduler will coordinate leadership through a lease");
            let api = collaborators.lease_api.clone().ok_or_else(|| {
                SchedulerError::Config(
                    "leader_mode is lease but no coordination service was provided".to_string(),
                )
            })?;
            Arc::new(LeaseLeaderController::new(
                api,
                std::time::Duration::from_millis(config.leader_lease_ttl_ms),
                std::time::Duration::from_millis(config.leader_renew_interval_ms),
            ))
        }
    };

    let submit_checker = Arc::new(FeasibilityChecker::new(executor_repository.clone()));
    let scheduling_algo = Arc::new(LeastLoadedAlgo::new(
        jobdb.clone(),
        executor_repository.clone(),
        config.executor_timeout(),
        Arc::clone(&clock),
    ));
    let mut scheduler = Scheduler::new(
        jobdb.clone(),
        Arc::clone(&collaborators.job_repository),
        executor_repository.clone(),
        scheduling_algo,
        Arc::clone(&leader_controller),
        publisher,
        submit_checker,
        config.cycle_period(),
        config.schedule_period(),
        config.executor_timeout(),
        config.max_attempts,
        Arc::clone(&clock),
    );

    let executor_api = ExecutorApiService::new(
        jobdb,
        Arc::clone(&collaborators.job_repository),
        executor_repository,
        Arc::clone(&collaborators.event_sink),
        Arc::clone(&leader_controller),
        config.node_id_label.clone(),
        clock,
    );

    let leader_task = {
        let controller = Arc::clone(&leader_controller);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { controller.run(shutdown).await })
    };
    let cycle_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let mut server = Server::builder();
    if let (Some(cert), Some(key)) = (&config.tls_cert_path, &config.tls_key_path) {
        let cert = tokio::fs::read(cert)
            .await
            .map_err(|e| SchedulerError::Config(format!("reading tls cert: {e}")))?;
        let key = tokio::fs::read(key)
            .await
            .map_err(|e| SchedulerError::Config(format!("reading tls key: {e}")))?;
        server = server
            .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))?;
    }

    tracing::info!(addr = %config.grpc_listen_addr, "executor api listening");
    let serve_shutdown = shutdown.clone();
    let serve_result = server
        .add_service(ExecutorApiServer::new(executor_api))
        .serve_with_shutdown(config.grpc_listen_addr, async move {
            serve_shutdown.cancelled().await;
        })
        .await;

    // The server only returns on shutdown or failure; either way, stop the
    // background loops before reporting.
    shutdown.cancel();
    let leader_result = leader_task
        .await
        .unwrap_or_else(|e| Err(SchedulerError::Internal(format!("leader task panicked: {e}"))));
    let cycle_result = cycle_task
        .await
        .unwrap_or_else(|e| Err(SchedulerError::Internal(format!("cycle task panicked: {e}"))));

    serve_result?;
    leader_result?;
    cycle_result
}
