// src/server/mod.rs

//! The daemon-side persistent-connection manager: the accept loop, the
//! bounded service pool and the shutdown broadcast.

mod dispatch;
mod pool;
mod service;
mod store;

pub use dispatch::{Dispatch, ServiceHandler};
pub use pool::{MAX_SERVICE_CONNS, ServicePool};
pub use store::{JobRecord, MemStore, StepRecord};

use crate::connection::{ConnFlags, PersistConn};
use crate::core::TallydError;
use crate::core::auth::AuthProvider;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Triggers the server's graceful shutdown from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// A bound listener plus everything its connections share.
pub struct Server {
    listener: TcpListener,
    pool: ServicePool,
    handler: Arc<dyn ServiceHandler>,
    auth: Arc<dyn AuthProvider>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Binds the listener and prepares the pool. Serving starts with
    /// [`Server::serve`].
    pub async fn bind(
        addr: &str,
        capacity: usize,
        handler: Arc<dyn ServiceHandler>,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, TallydError> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            listener,
            pool: ServicePool::new(capacity),
            handler,
            auth,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TallydError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Accepts connections until shutdown, one pooled service task per
    /// connection, then drains the pool.
    pub async fn serve(self) -> Result<(), TallydError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(
            "accepting persistent connections on {} (capacity {})",
            self.listener.local_addr()?,
            self.pool.capacity()
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                res = self.listener.accept() => {
                    let (socket, addr) = match res {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("failed to accept connection: {e}");
                            continue;
                        }
                    };
                    debug!("accepted connection from {addr}");

                    // Block further accepts until the pool has room; the
                    // listen backlog absorbs the burst.
                    let slot = tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => break,
                        slot = self.pool.reserve() => match slot {
                            Some(slot) => slot,
                            None => break,
                        },
                    };

                    let conn = PersistConn::from_stream(
                        socket,
                        ConnFlags::DBD_MODE,
                        self.auth.clone(),
                        self.shutdown_tx.subscribe(),
                    );
                    let handler = self.handler.clone();
                    let pool = self.pool.clone();
                    let handle = tokio::spawn(async move {
                        service::process_service_connection(conn, handler).await;
                        pool.release(slot).await;
                    });
                    self.pool.attach(slot, handle).await;
                }
            }
        }

        info!("shutting down, draining service connections");
        let _ = self.shutdown_tx.send(true);
        self.pool.shutdown().await;
        info!("server shutdown complete");
        Ok(())
    }
}
