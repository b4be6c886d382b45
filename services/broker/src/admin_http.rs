// Admin commands over HTTP: the request body is one text command, the
// response body is the rendered reply.
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use std::net::SocketAddr;
use wharf_broker::admin::AdminExecutor;

pub fn router(executor: AdminExecutor) -> Router {
    Router::new()
        .route("/admin", post(run_command))
        .with_state(executor)
}

async fn run_command(State(executor): State<AdminExecutor>, body: String) -> (StatusCode, String) {
    match executor.execute_text(&body).await {
        Ok(reply) => {
            metrics::counter!("wharf_admin_commands_total").increment(1);
            (StatusCode::OK, reply)
        }
        Err(err) => {
            metrics::counter!("wharf_admin_rejected_total").increment(1);
            tracing::debug!(error = %err, "rejected admin command");
            (StatusCode::BAD_REQUEST, err.to_string())
        }
    }
}

pub async fn serve_admin(executor: AdminExecutor, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "admin listener started");
    axum::serve(listener, router(executor).into_make_service()).await
}
