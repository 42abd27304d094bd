//! Worker process entrypoint (§6, §9). Boots configuration, the Postgres
//! pool, the broker connection and topology, then spawns one task per queue
//! consumer plus the outbox dispatcher, and waits for SIGINT/SIGTERM to
//! drive the graceful shutdown watch channel.

mod config;
mod consumers;
mod dispatcher;
mod ingress;
mod saga;
mod wrap;

use std::sync::Arc;
use std::time::Duration;

use loanserve_broker::{BrokerClient, ConsumeOptions, Topology};
use loanserve_core::policy::ClassifierConfig;
use loanserve_storage::allocation_rules::AllocationRuleRepository;
use loanserve_storage::distributions::DistributionRepository;
use loanserve_storage::escrow::EscrowRepository;
use loanserve_storage::events::EventRepository;
use loanserve_storage::exceptions::ExceptionCaseRepository;
use loanserve_storage::ledger::LedgerRepository;
use loanserve_storage::loans::PgLoanDirectory;
use loanserve_storage::outbox::OutboxRepository;
use loanserve_storage::payments::PaymentRepository;
use loanserve_storage::return_windows::ReturnWindowRepository;
use tracing::{error, info};

use crate::config::Settings;
use crate::consumers::allocation::AllocationConsumer;
use crate::consumers::classification::ClassificationConsumer;
use crate::consumers::distribution::DistributionConsumer;
use crate::consumers::returns::ReturnsConsumer;
use crate::consumers::validation::ValidationConsumer;
use crate::dispatcher::Dispatcher;
use crate::saga::ReversalSaga;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Arc::new(Settings::load()?);

    let pool = loanserve_storage::connect(&settings.database_url, 20).await?;
    loanserve_storage::run_migrations(&pool).await?;
    info!("migrations applied");

    let broker = Arc::new(BrokerClient::connect(&settings.amqp_url, None).await?);
    broker.provision_topology(&Topology).await?;
    info!("broker topology provisioned");

    let loans = Arc::new(PgLoanDirectory::new(pool.clone()));

    let payments = PaymentRepository::new(pool.clone());
    let events = EventRepository::new(pool.clone());
    let outbox = OutboxRepository::new(pool.clone());
    let exceptions = ExceptionCaseRepository::new(pool.clone());
    let return_windows = ReturnWindowRepository::new(pool.clone());
    let rules = AllocationRuleRepository::new(pool.clone());
    let ledger = LedgerRepository;
    let escrow = EscrowRepository::new(pool.clone());
    let distributions = DistributionRepository::new(pool.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = tokio::task::JoinSet::new();

    {
        let broker = broker.clone();
        let outbox = outbox.clone();
        let exceptions = exceptions.clone();
        let settings = settings.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.spawn(async move {
            Dispatcher::new(outbox, exceptions, &settings)
                .run(&broker, shutdown_rx)
                .await;
            Ok(())
        });
    }

    let handler_timeout = Duration::from_millis(settings.handler_timeout_ms);

    let validation = ValidationConsumer::new(
        pool.clone(),
        payments.clone(),
        outbox.clone(),
        events.clone(),
        return_windows.clone(),
        loans.clone(),
        settings.clone(),
    );
    spawn_consumer(&mut tasks, broker.clone(), "payments.validation", 10, handler_timeout, validation, shutdown_rx.clone());

    let classification = ClassificationConsumer::new(
        pool.clone(),
        outbox.clone(),
        events.clone(),
        exceptions.clone(),
        loans.clone(),
        ClassifierConfig::default(),
    );
    spawn_consumer(&mut tasks, broker.clone(), "payments.classification", 25, handler_timeout, classification, shutdown_rx.clone());

    let allocation = AllocationConsumer::new(
        pool.clone(),
        payments.clone(),
        rules.clone(),
        ledger,
        escrow.clone(),
        events.clone(),
        outbox.clone(),
        loans.clone(),
    );
    spawn_consumer(&mut tasks, broker.clone(), "payments.allocation", 10, handler_timeout, allocation, shutdown_rx.clone());

    let distribution = DistributionConsumer::new(
        pool.clone(),
        payments.clone(),
        distributions.clone(),
        events.clone(),
        outbox.clone(),
        settings.servicing_bps,
    );
    spawn_consumer(&mut tasks, broker.clone(), "payments.distribution", 10, handler_timeout, distribution, shutdown_rx.clone());

    let reversal = ReversalSaga::new(
        pool.clone(),
        payments.clone(),
        ledger,
        escrow.clone(),
        distributions.clone(),
        events.clone(),
        outbox.clone(),
        exceptions.clone(),
        settings.clone(),
    );
    spawn_consumer(&mut tasks, broker.clone(), "payments.reversal", 5, handler_timeout, reversal, shutdown_rx.clone());

    let returns = ReturnsConsumer::new(pool.clone(), payments.clone(), events.clone(), outbox.clone(), exceptions.clone());
    spawn_consumer(&mut tasks, broker.clone(), "payments.returned", 10, handler_timeout, returns, shutdown_rx.clone());

    wait_for_shutdown_signal().await;
    info!(grace_ms = settings.graceful_ms, "shutdown signal received, draining consumers");
    shutdown_tx.send(true).ok();

    let grace = Duration::from_millis(settings.graceful_ms);
    let drain = async {
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Err(err)) => error!(%err, "consumer task exited with an error"),
                Err(err) => error!(%err, "consumer task panicked"),
                Ok(Ok(())) => {}
            }
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        error!("graceful shutdown window elapsed with tasks still running");
    }

    Ok(())
}

fn spawn_consumer<H>(
    tasks: &mut tokio::task::JoinSet<anyhow::Result<()>>,
    broker: Arc<BrokerClient>,
    queue: &'static str,
    prefetch: u16,
    handler_timeout: Duration,
    handler: H,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) where
    H: loanserve_broker::ConsumerHandler + 'static,
{
    tasks.spawn(async move {
        let opts = ConsumeOptions {
            queue: queue.into(),
            prefetch,
            consumer_tag: format!("{queue}-consumer"),
            handler_timeout,
        };
        loanserve_broker::consumer::consume(&broker, opts, handler, shutdown_rx).await?;
        Ok(())
    });
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
