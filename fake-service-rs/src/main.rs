// fake-service-rs/src/main.rs

use std::collections::HashMap;
use std::sync::Arc;

use fake_service::client::{GrpcClient, ReqwestClient, TonicClient};
use fake_service::dispatch::GrpcClients;
use fake_service::handlers::{cors_layer, create_router, AppState, FakeServer, Health, Readiness};
use fake_service::load::{request_generator, LoadGenerator};
use fake_service::logging::init_logging;
use fake_service::timing::SeededRandom;
use fake_service::{ErrorInjector, RequestDuration, RequestOrchestrator, ServiceError, ServiceSettings};
use tokio::sync::watch;
use tonic::transport::Server;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    config_rs::load_dotenv();

    let settings = ServiceSettings::from_env();
    let _log_guard = init_logging(&settings.logging)?;

    info!(
        name = %settings.name,
        upstreams = ?settings.upstream_uris,
        http = %settings.listen_addr,
        grpc = %settings.grpc_listen_addr,
        "Starting service"
    );

    let mut duration = RequestDuration::new(
        settings.timing_50_percentile,
        settings.timing_90_percentile,
        settings.timing_99_percentile,
        settings.timing_variance,
    );
    if let Some(seed) = settings.seed {
        duration = duration.with_random_source(SeededRandom::new(seed));
    }

    let mut grpc_clients: GrpcClients = HashMap::new();
    for uri in settings.grpc_upstreams() {
        let client = TonicClient::connect_lazy(uri, settings.http_client.timeout)?;
        grpc_clients.insert(uri.clone(), Arc::new(client) as Arc<dyn GrpcClient>);
    }

    let readiness = Arc::new(Readiness::new(
        settings.ready_check_delay,
        settings.ready_check_success_code,
        settings.ready_check_failure_code,
    ));
    let health = Arc::new(Health::new(settings.health_check_response_code));

    let orchestrator = RequestOrchestrator::builder(settings.orchestrator())
        .duration(duration)
        .injector(Arc::new(ErrorInjector::new(settings.injector.clone())))
        .readiness(readiness.clone())
        .load(LoadGenerator::new(&settings.load))
        .request_generator(request_generator(
            &settings.upstream_request_body,
            settings.upstream_request_size,
            settings.upstream_request_variance,
            settings.seed,
        ))
        .http_client(Arc::new(ReqwestClient::new(&settings.http_client)?))
        .grpc_clients(grpc_clients)
        .build()?;
    let orchestrator = Arc::new(orchestrator);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // HTTP
    let app = create_router(
        AppState {
            orchestrator: orchestrator.clone(),
            readiness,
            health,
        },
        cors_layer(&settings.cors),
    )
    .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(settings.listen_addr)
        .await
        .map_err(|e| ServiceError::transport(format!("Unable to bind {}: {}", settings.listen_addr, e)))?;
    info!("HTTP server listening on {}", settings.listen_addr);

    let http_shutdown = shutdown_rx.clone();
    let http = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_shutdown(http_shutdown))
            .await
            .map_err(|e| ServiceError::transport(e.to_string()))
    };

    // gRPC
    info!("gRPC server listening on {}", settings.grpc_listen_addr);

    let grpc = Server::builder()
        .add_service(FakeServer::new(orchestrator).into_service())
        .serve_with_shutdown(settings.grpc_listen_addr, wait_for_shutdown(shutdown_rx));
    let grpc = async move { grpc.await.map_err(|e| ServiceError::transport(e.to_string())) };

    if let Err(e) = futures::future::try_join(http, grpc).await {
        error!(error = %e, "Server terminated");
        return Err(e.into());
    }

    info!("Service stopped");
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Unable to listen for SIGTERM");
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
}
