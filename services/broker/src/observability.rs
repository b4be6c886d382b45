//! Tracing and metrics setup for the broker service.
//!
//! Installs a fmt subscriber filtered by `RUST_LOG` (default `info`) and a
//! Prometheus recorder, and serves `/metrics`, `/live` and `/ready` over HTTP.
//! In tests the recorder is installed once and reused.

use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes logging and the metrics recorder.
///
/// Returns the handle `serve_metrics` renders from.
pub fn init_observability(service_name: &str) -> anyhow::Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    init_subscriber(registry);
    let handle = install_metrics_recorder()?;
    tracing::debug!(service = service_name, "observability initialized");
    Ok(handle)
}

/// Serves Prometheus metrics and health endpoints on the given address.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, metrics_router(handle).into_make_service()).await
}

fn metrics_router(handle: PrometheusHandle) -> axum::Router {
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }))
}

fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return Ok(handle.clone());
        }
        let handle = PrometheusBuilder::new().install_recorder()?;
        let _ = METRICS_HANDLE.set(handle.clone());
        Ok(handle)
    }
    #[cfg(not(test))]
    {
        Ok(PrometheusBuilder::new().install_recorder()?)
    }
}

// Tests may initialize more than once; the binary initializes exactly once.
fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
    }
    #[cfg(not(test))]
    {
        subscriber.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn recorder_is_cached_in_tests() {
        let first = install_metrics_recorder().expect("recorder");
        let second = install_metrics_recorder().expect("recorder");
        metrics::counter!("wharf_test_total").increment(1);
        assert!(first.render().contains("wharf_test_total"));
        assert!(second.render().contains("wharf_test_total"));
    }

    #[tokio::test]
    #[serial]
    async fn serve_metrics_endpoints_respond() {
        let handle = init_observability("wharf-broker-test").expect("observability");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, metrics_router(handle).into_make_service())
                .await
                .ok();
        });

        let response = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .expect("metrics");
        assert_eq!(response.status(), 200);
        for path in ["live", "ready"] {
            let response = reqwest::get(format!("http://{addr}/{path}"))
                .await
                .expect("probe");
            assert_eq!(response.status(), 200);
            assert_eq!(response.text().await.expect("body"), "ok");
        }
    }
}
