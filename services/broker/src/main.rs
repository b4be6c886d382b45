// Broker service main entry point.
mod observability;

use anyhow::Result;
use broker::admin_http;
use broker::config::BrokerConfig;
use broker::node::BrokerNode;
use std::future::Future;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("wharf-broker")?;
    let config = BrokerConfig::from_env_or_yaml()?;
    let node = BrokerNode::start(&config).await?;

    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));
    let admin_task = {
        let executor = node.admin();
        let addr = config.admin_bind;
        tokio::spawn(async move {
            if let Err(err) = admin_http::serve_admin(executor, addr).await {
                tracing::warn!(error = %err, "admin listener exited");
            }
        })
    };

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    admin_task.abort();
    metrics_task.abort();
    node.shutdown();
    tracing::info!("broker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_from_env() -> Result<()> {
        let _g1 = EnvGuard::set("WHARF_BROKER_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("WHARF_ADMIN_BIND", "127.0.0.1:0");
        let _g3 = EnvGuard::unset("WHARF_BROKER_CONFIG");
        run_with_shutdown(async {}).await?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_rejects_missing_config_file() {
        let _g1 = EnvGuard::set("WHARF_BROKER_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("WHARF_ADMIN_BIND", "127.0.0.1:0");
        let _g3 = EnvGuard::set("WHARF_BROKER_CONFIG", "/nonexistent/wharf.yaml");
        assert!(run_with_shutdown(async {}).await.is_err());
    }
}
