//! Container health probe — TCP pings against the runtime proxy port.
//!
//! Each started container gets its own probe task. After `max_fails`
//! consecutive connect failures the task signals a health failure to the
//! owning proxy and terminates itself.

use crate::core::proxy::{ContainerFailure, ProxyMsg};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Health probe settings
#[derive(Debug, Clone, Copy)]
pub struct HealthProbeConfig {
    /// Time between pings
    pub check_period: Duration,
    /// Connect timeout per ping
    pub connect_timeout: Duration,
    /// Consecutive failures before the container is declared unhealthy
    pub max_fails: u32,
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self {
            check_period: Duration::from_secs(1),
            connect_timeout: Duration::from_millis(200),
            max_fails: 3,
        }
    }
}

/// Spawn a TCP health probe for a container.
///
/// The task exits when the proxy drops its receiver or after signalling an
/// unhealthy container; abort the returned handle to cancel it early.
pub fn spawn_health_probe(
    container_id: String,
    addr: (String, u16),
    config: HealthProbeConfig,
    proxy: mpsc::UnboundedSender<ProxyMsg>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let target = format!("{}:{}", addr.0, addr.1);
        let mut consecutive_fails = 0u32;

        loop {
            tokio::time::sleep(config.check_period).await;

            let connect = TcpStream::connect(&target);
            let healthy = matches!(
                tokio::time::timeout(config.connect_timeout, connect).await,
                Ok(Ok(_))
            );

            if healthy {
                consecutive_fails = 0;
                continue;
            }

            consecutive_fails += 1;
            tracing::debug!(
                container_id = %container_id,
                target = %target,
                fails = consecutive_fails,
                "Health ping failed"
            );

            if consecutive_fails >= config.max_fails {
                tracing::warn!(
                    container_id = %container_id,
                    target = %target,
                    "Container unhealthy after {} consecutive ping failures",
                    consecutive_fails
                );
                let _ = proxy.send(ProxyMsg::Failure(ContainerFailure::Health(format!(
                    "{} consecutive ping failures against {}",
                    consecutive_fails, target
                ))));
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_config(max_fails: u32) -> HealthProbeConfig {
        HealthProbeConfig {
            check_period: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(50),
            max_fails,
        }
    }

    #[tokio::test]
    async fn test_healthy_container_gets_no_signal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_health_probe(
            "c1".into(),
            ("127.0.0.1".into(), port),
            fast_config(2),
            tx,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_container_signals_after_max_fails() {
        // Bind and immediately drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_health_probe(
            "c1".into(),
            ("127.0.0.1".into(), port),
            fast_config(3),
            tx,
        );

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("probe should signal")
            .expect("channel open");
        assert!(matches!(
            msg,
            ProxyMsg::Failure(ContainerFailure::Health(_))
        ));

        // Task self-terminates after signalling
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("probe task should exit")
            .unwrap();
    }
}
