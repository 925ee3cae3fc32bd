use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use logbook_verification::api::{self, AppState};
use logbook_verification::audit::{AuditLogger, AuditSink, NullAuditSink};
use logbook_verification::config::AppConfig;
use logbook_verification::database::Database;
use logbook_verification::identity::SqlIdentityProvider;
use logbook_verification::tasks::{RetryPolicy, TaskQueue, TaskWorker};
use logbook_verification::verification::{
    EntryUpdateInvalidator, ReviewStateMachine, VerificationLedger, VerifierBackfill,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logbook_verification=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting logbook verification engine");

    let config = AppConfig::load()?;
    info!("Configuration loaded");

    let database = Database::new(&config.database_url).await?;
    info!("Database connected");

    database.run_migrations().await?;
    info!("Database migrations completed");

    let audit: Arc<dyn AuditSink> = if config.audit.enabled {
        let logger = AuditLogger::new(config.audit.log_path.clone(), &config.server_id).await?;
        info!(
            "Audit logger writing to {:?} ({} records)",
            logger.log_path(),
            logger.get_entry_count().await
        );
        Arc::new(logger)
    } else {
        info!("Audit logging disabled");
        Arc::new(NullAuditSink)
    };

    let pool = database.pool().clone();
    let identity = Arc::new(SqlIdentityProvider::new(pool.clone()));
    let machine = ReviewStateMachine::new(pool.clone(), identity, audit.clone());
    let ledger = VerificationLedger::new(pool.clone(), audit.clone());
    let backfill = VerifierBackfill::new(pool.clone(), config.tasks.backfill_batch_size);
    let invalidator = EntryUpdateInvalidator::new(
        pool,
        audit,
        config.entries.ignored_fields.clone(),
    );

    let (tasks, receiver) = TaskQueue::channel();
    TaskWorker::new(backfill, invalidator, RetryPolicy::from_config(&config.tasks)).spawn(receiver);
    info!("Task worker started");

    let app = api::router(AppState {
        db: database,
        machine,
        ledger,
        tasks,
        server_id: config.server_id.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
