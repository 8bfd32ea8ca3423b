//! TCP listener driving SMTP sessions

use crate::ingest::IngestCoordinator;
use crate::smtp::SmtpSession;
use mailgate_common::config::SmtpConfig;
use mailgate_common::{Error, Result};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accept loop: one spawned session per connection, bounded by a
/// connection-count semaphore.
pub struct SmtpServer {
    config: SmtpConfig,
    coordinator: Arc<IngestCoordinator>,
}

impl SmtpServer {
    pub fn new(config: SmtpConfig, coordinator: Arc<IngestCoordinator>) -> Self {
        Self {
            config,
            coordinator,
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Smtp(format!("failed to bind {}: {}", addr, e)))?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already-bound listener until shutdown,
    /// then drain in-flight sessions.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "SMTP listener started");
        }

        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        let mut sessions = JoinSet::new();

        loop {
            while sessions.try_join_next().is_some() {}

            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (mut stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    let Ok(permit) = limit.clone().try_acquire_owned() else {
                        debug!(%peer, "Connection limit reached, refusing connection");
                        let _ = stream
                            .write_all(b"421 4.3.2 Too many connections, try again later\r\n")
                            .await;
                        continue;
                    };

                    let session = SmtpSession::new(
                        self.config.clone(),
                        self.coordinator.clone(),
                        peer.ip(),
                        stream,
                    );
                    let token = shutdown.clone();
                    sessions.spawn(async move {
                        if let Err(e) = session.run(token).await {
                            debug!(%peer, error = %e, "Session ended with error");
                        }
                        drop(permit);
                    });
                }
            }
        }

        info!("SMTP listener stopping, draining sessions");
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}
