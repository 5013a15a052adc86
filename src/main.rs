use std::{collections::BTreeMap, process, sync::Arc, time::Duration};

use esigate::{
    application::admin::AdminService,
    application::auth::{AuthClient, PassthroughCipher},
    application::error::AppError,
    application::executor::EsiClient,
    application::governor::RateGovernor,
    application::jobs::{
        EnqueueOptions, JobDispatcher, JobQueue, MaintenanceService, TokenRefreshService,
        WorkerPool, WorkerPoolConfig, WorkerRegistry,
    },
    application::repos::{CharactersRepo, JobsRepo},
    application::scheduler::{ScheduleSpec, Scheduler, ScheduledTask},
    cache::ResponseCache,
    config,
    domain::types::{JobPayload, JobPriority, queues},
    infra::{
        InfraError, PostgresRepositories, ReqwestTransport, SsoAuthClient, telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Refresh(args) => run_refresh(settings, args).await,
        config::Command::Sweep(_) => run_sweep(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let app = build_application_context(repositories, &settings)?;

    // One upstream round-trip on startup proves connectivity and primes the
    // governor with the current error budget.
    match app
        .esi
        .fetch("/status", &BTreeMap::new(), None, None)
        .await
    {
        Ok(_) => info!(target: "esigate", "upstream reachable"),
        Err(err) => warn!(target: "esigate", error = %err, "upstream status probe failed"),
    }

    let mut worker_handles = Vec::new();
    for (queue, concurrency) in [
        (
            queues::REFRESH,
            settings.queues.refresh_concurrency.get() as usize,
        ),
        (
            queues::MAINTENANCE,
            settings.queues.maintenance_concurrency.get() as usize,
        ),
    ] {
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig {
                queue: queue.to_string(),
                concurrency,
                poll_interval: settings.queues.poll_interval,
            },
            app.jobs_repo.clone(),
            app.dispatcher.clone(),
            app.registry.clone(),
        ));
        worker_handles.push(pool.spawn());
    }

    app.scheduler.register(
        ScheduleSpec {
            name: "refresh-scan".to_string(),
            expression: settings.refresh.scan_expression(),
            timezone: chrono_tz::UTC,
            run_on_init: true,
        },
        Arc::new(RefreshScanTask {
            refresh: app.refresh.clone(),
        }),
    )?;
    app.scheduler.register(
        ScheduleSpec {
            name: "cache-sweep".to_string(),
            expression: "0 0 * * * *".to_string(),
            timezone: chrono_tz::UTC,
            run_on_init: false,
        },
        Arc::new(SweepScheduleTask {
            queue: app.queue.clone(),
        }),
    )?;
    app.scheduler.start("refresh-scan")?;
    app.scheduler.start("cache-sweep")?;

    let health_handle = spawn_health_reporter(app.admin.clone());

    info!(target: "esigate", "gateway running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::from(InfraError::Io(err)))?;
    info!(target: "esigate", "shutting down");

    app.scheduler.stop_all();
    health_handle.abort();
    for handle in worker_handles {
        handle.abort();
        let _ = handle.await;
    }

    Ok(())
}

async fn run_refresh(
    settings: config::Settings,
    args: config::RefreshArgs,
) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let queue = JobQueue::new(repositories);

    let id = queue
        .enqueue(
            JobPayload::RefreshToken {
                character_id: args.character_id,
            },
            EnqueueOptions::priority(JobPriority::Critical),
        )
        .await?;

    info!(
        target: "esigate",
        character_id = args.character_id,
        job_id = %id,
        "refresh queued; a running gateway will pick it up"
    );
    Ok(())
}

async fn run_sweep(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let cache = Arc::new(ResponseCache::new(settings.cache.config(), repositories));
    let maintenance = MaintenanceService::new(cache);

    let removed = maintenance.sweep_expired_cache().await;
    info!(target: "esigate", removed, "sweep finished");
    Ok(())
}

struct ApplicationContext {
    jobs_repo: Arc<dyn JobsRepo>,
    queue: Arc<JobQueue>,
    esi: Arc<EsiClient>,
    refresh: Arc<TokenRefreshService>,
    dispatcher: Arc<JobDispatcher>,
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<Scheduler>,
    admin: Arc<AdminService>,
}

async fn init_repositories(
    settings: &config::Settings,
) -> Result<Arc<PostgresRepositories>, AppError> {
    let database_url = settings
        .database
        .required_url()
        .map_err(|err| AppError::validation(err.to_string()))?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(Arc::new(PostgresRepositories::new(pool)))
}

fn build_application_context(
    repositories: Arc<PostgresRepositories>,
    settings: &config::Settings,
) -> Result<ApplicationContext, AppError> {
    let jobs_repo: Arc<dyn JobsRepo> = repositories.clone();
    let characters_repo: Arc<dyn CharactersRepo> = repositories.clone();

    let cache = Arc::new(ResponseCache::new(
        settings.cache.config(),
        repositories.clone(),
    ));
    let governor = Arc::new(RateGovernor::new(
        settings.governor.config(),
        cache.clone(),
    ));
    let transport = Arc::new(
        ReqwestTransport::new(
            &settings.upstream.base_url,
            &settings.upstream.user_agent,
            settings.upstream.timeout,
        )
        .map_err(AppError::from)?,
    );
    let esi = Arc::new(EsiClient::new(
        transport,
        cache.clone(),
        governor,
        settings.retry.policy(),
    ));

    let queue = Arc::new(JobQueue::new(jobs_repo.clone()));
    let auth = build_auth_client(&settings.sso)?;
    let refresh = Arc::new(TokenRefreshService::new(
        characters_repo,
        auth,
        Arc::new(PassthroughCipher),
        queue.clone(),
        settings.refresh.expiry_buffer,
    ));
    let maintenance = Arc::new(MaintenanceService::new(cache.clone()));
    let dispatcher = Arc::new(JobDispatcher::new(refresh.clone(), maintenance));

    let registry = Arc::new(WorkerRegistry::default());
    let scheduler = Arc::new(Scheduler::default());
    let admin = Arc::new(AdminService::new(
        jobs_repo.clone(),
        registry.clone(),
        scheduler.clone(),
        refresh.clone(),
    ));

    Ok(ApplicationContext {
        jobs_repo,
        queue,
        esi,
        refresh,
        dispatcher,
        registry,
        scheduler,
        admin,
    })
}

fn build_auth_client(sso: &config::SsoSettings) -> Result<Arc<dyn AuthClient>, AppError> {
    let client_id = sso
        .client_id
        .as_deref()
        .ok_or_else(|| InfraError::configuration("sso.client_id is not configured"))
        .map_err(AppError::from)?;
    let client_secret = sso
        .client_secret
        .as_deref()
        .ok_or_else(|| InfraError::configuration("sso.client_secret is not configured"))
        .map_err(AppError::from)?;

    Ok(Arc::new(
        SsoAuthClient::new(&sso.token_url, client_id, client_secret, sso.timeout)
            .map_err(AppError::from)?,
    ))
}

struct RefreshScanTask {
    refresh: Arc<TokenRefreshService>,
}

#[async_trait::async_trait]
impl ScheduledTask for RefreshScanTask {
    async fn run(&self) {
        if let Err(err) = self.refresh.scan_and_enqueue().await {
            error!(target: "esigate", error = %err, "refresh scan failed");
        }
    }
}

struct SweepScheduleTask {
    queue: Arc<JobQueue>,
}

#[async_trait::async_trait]
impl ScheduledTask for SweepScheduleTask {
    async fn run(&self) {
        let enqueued = self
            .queue
            .enqueue(
                JobPayload::SweepExpiredCache,
                EnqueueOptions::priority(JobPriority::Batch),
            )
            .await;
        if let Err(err) = enqueued {
            error!(target: "esigate", error = %err, "failed to enqueue cache sweep");
        }
    }
}

fn spawn_health_reporter(admin: Arc<AdminService>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            match admin.health().await {
                Ok(report) => {
                    for queue in &report.queues {
                        info!(
                            target: "esigate::health",
                            queue = %queue.queue,
                            paused = queue.paused,
                            waiting = queue.counts.waiting,
                            active = queue.counts.active,
                            failed = queue.counts.failed,
                            delayed = queue.counts.delayed,
                            workers_healthy = report.workers_healthy,
                            "queue status"
                        );
                    }
                }
                Err(err) => warn!(target: "esigate::health", error = %err, "health probe failed"),
            }
        }
    })
}
