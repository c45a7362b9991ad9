//! Reconnect supervision for connections outside the pool.
//!
//! A [`Reconnector`] keeps dialing one [`Connection`] until it comes up,
//! then hands the address back to the load balancer. The balancer is told
//! the node exists but not that it is alive; liveness confirmation is the
//! balancer's own business.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::backoff::{Backoff, ReconnectConfig};
use crate::core::{Balancer, Codec, Result};
use crate::transport::{Connection, ConnectionState};

/// Background retry loop for one connection.
pub struct Reconnector {
    addr: String,
    running: Arc<AtomicBool>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<bool>>>,
}

impl Reconnector {
    /// Start retrying `connection`.
    ///
    /// Each round attempts a dial first and sleeps the backoff delay only
    /// after a failure. Must be called from within a tokio runtime.
    pub fn spawn<C: Codec>(
        connection: Arc<Connection<C>>,
        balancer: Arc<dyn Balancer>,
        config: ReconnectConfig,
    ) -> Result<Self> {
        config.validate()?;
        let addr = connection.address().to_string();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let running = Arc::new(AtomicBool::new(true));
        let task = {
            let running = Arc::clone(&running);
            tokio::spawn(async move {
                let reconnected = run(connection, balancer, config, shutdown_rx).await;
                running.store(false, Ordering::SeqCst);
                reconnected
            })
        };

        Ok(Self {
            addr,
            running,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Address being reconnected.
    pub fn address(&self) -> &str {
        &self.addr
    }

    /// Whether the retry loop is still going.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop retrying and wait for the loop to exit.
    ///
    /// Returns `true` if the loop had already reconnected. Calling it again
    /// is a no-op returning `false`.
    pub async fn stop(&self) -> bool {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(());
        }

        let mut task = self.task.lock().await;
        match task.take() {
            Some(handle) => {
                let reconnected = handle.await.unwrap_or(false);
                debug!(addr = %self.addr, reconnected, "reconnector stopped");
                reconnected
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Reconnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconnector")
            .field("addr", &self.addr)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn reconnect<C: Codec>(connection: &Connection<C>) -> Result<()> {
    match connection.state() {
        ConnectionState::Connected => Ok(()),
        ConnectionState::Disconnected => connection.dial().await,
        ConnectionState::Connecting | ConnectionState::Disconnecting => connection.redial().await,
    }
}

async fn run<C: Codec>(
    connection: Arc<Connection<C>>,
    balancer: Arc<dyn Balancer>,
    config: ReconnectConfig,
    mut shutdown: oneshot::Receiver<()>,
) -> bool {
    let addr = connection.address().to_string();
    let mut backoff = Backoff::new(config);

    loop {
        let result = tokio::select! {
            biased;
            _ = &mut shutdown => return false,
            result = reconnect(&connection) => result,
        };

        match result {
            Ok(()) => {
                info!(%addr, attempts = backoff.attempts() + 1, "reconnected");
                balancer.register(&addr);
                balancer.set_alive(&addr, false);
                return true;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                debug!(%addr, attempt = backoff.attempts(), ?delay, error = %e, "reconnect failed");
                tokio::select! {
                    biased;
                    _ = &mut shutdown => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
