//! Long-running background services sharing one shutdown signal.

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A background loop that runs until `shutdown` is cancelled.
#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Runs a set of services and stops them together.
#[derive(Default)]
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Run every service until `shutdown` fires or one of them exits.
    ///
    /// A service that returns (or fails) early cancels the rest.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut set = JoinSet::new();

        for service in self.services {
            let name = service.name();
            let token = shutdown.clone();
            info!(service = name, "service starting");
            set.spawn(async move { (name, service.run(token).await) });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(service = name, "service stopped"),
                Ok((name, Err(e))) => {
                    error!(service = name, error = %e, "service failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "service panicked");
                    first_error.get_or_insert(e.into());
                }
            }
            shutdown.cancel();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run until Ctrl-C.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = CancellationToken::new();

        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
            signal.cancel();
        });

        self.run(shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct WaitForShutdown(Arc<AtomicBool>);

    #[async_trait]
    impl Service for WaitForShutdown {
        fn name(&self) -> &'static str {
            "wait"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ExitsImmediately;

    #[async_trait]
    impl Service for ExitsImmediately {
        fn name(&self) -> &'static str {
            "exit"
        }

        async fn run(self: Box<Self>, _shutdown: CancellationToken) -> Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn failing_service_stops_the_others() {
        let stopped = Arc::new(AtomicBool::new(false));
        let result = ServiceHost::new()
            .with_service(WaitForShutdown(stopped.clone()))
            .with_service(ExitsImmediately)
            .run(CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_stops_all_services() {
        let stopped = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();
        token.cancel();

        ServiceHost::new()
            .with_service(WaitForShutdown(stopped.clone()))
            .run(token)
            .await
            .unwrap();

        assert!(stopped.load(Ordering::SeqCst));
    }
}
