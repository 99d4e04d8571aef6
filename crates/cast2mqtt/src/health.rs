use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpResponse, HttpServer, Responder, get, web};
use serde::Serialize;

use crate::session::Session;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub struct HealthState {
    session: Arc<Session>,
}

/// Liveness check: asks the device for a fresh status.
#[get("/status")]
async fn status(state: web::Data<HealthState>) -> impl Responder {
    let session = state.session.clone();
    let answered = actix_web::rt::time::timeout(
        HEALTH_TIMEOUT,
        web::block(move || session.refresh()),
    )
    .await;
    let error = match answered {
        Ok(Ok(Ok(()))) => return HttpResponse::Ok().json(HealthResponse { status: "ok", error: None }),
        Ok(Ok(Err(e))) => e.to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("no answer within {HEALTH_TIMEOUT:?}"),
    };
    tracing::warn!(error = %error, "health check failed");
    HttpResponse::ServiceUnavailable().json(HealthResponse {
        status: "unavailable",
        error: Some(error),
    })
}

/// Serve `/status` on its own thread and actix system. Bind errors are logged only.
pub fn spawn_health_server(bind: SocketAddr, session: Arc<Session>) {
    let spawned = std::thread::Builder::new()
        .name("health".to_string())
        .spawn(move || {
            let state = web::Data::new(HealthState { session });
            let result = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || App::new().app_data(state.clone()).service(status))
                    .workers(1)
                    .disable_signals()
                    .bind(bind)?;
                tracing::info!(bind = %bind, "health endpoint listening");
                server.run().await
            });
            if let Err(e) = result {
                tracing::error!(bind = %bind, error = %e, "health server failed");
            }
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "unable to spawn health server thread");
    }
}
