//! TCP accept loop and per-connection task.
//! Connections beyond `max_connections` are rejected at accept time with
//! a brief `Error` frame before the socket is closed, rather than queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::auth::CredentialStore;
use crate::config::NetworkConfig;
use crate::document::database::Catalog;
use crate::error::Result;
use crate::protocol::codec::{encode_payload, read_frame, write_frame};
use crate::protocol::dispatch::Dispatcher;
use crate::protocol::frame::MessageType;
use crate::protocol::message::ErrorBody;
use crate::protocol::session::Session;

pub struct Server {
    network: NetworkConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    pub fn new(network: NetworkConfig, catalog: Arc<Catalog>, credentials: Arc<CredentialStore>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            network,
            dispatcher: Arc::new(Dispatcher::new(catalog, credentials)),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// A clone-able handle that signals every in-flight `run()` to stop
    /// accepting and tells connection tasks to close after their current
    /// request.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.network.bind_host, self.network.bind_port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "listening");

        let permits = Arc::new(Semaphore::new(self.network.max_connections));
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("shutting down accept loop");
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let permit = match permits.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(%peer, "rejecting connection: max_connections reached");
                            tokio::spawn(reject_connection(stream));
                            continue;
                        }
                    };
                    let dispatcher = self.dispatcher.clone();
                    let idle_timeout = self.network.idle_timeout;
                    let shutdown_rx = self.shutdown_rx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_connection(stream, dispatcher, idle_timeout, shutdown_rx).await {
                            debug!(%peer, error = %e, "connection ended");
                        }
                    });
                }
            }
        }
    }
}

async fn reject_connection(mut stream: TcpStream) {
    let body = ErrorBody {
        code: "Busy".to_string(),
        message: "server has reached max_connections".to_string(),
    };
    if let Ok(bytes) = encode_payload(&body) {
        let _ = write_frame(&mut stream, MessageType::Error, &bytes).await;
    }
    let _ = stream.shutdown().await;
}

async fn handle_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    idle_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);
    let mut session = Session::new();

    loop {
        let frame = tokio::select! {
            frame = tokio::time::timeout(idle_timeout, read_frame(&mut reader)) => frame,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return Ok(());
                }
                continue;
            }
        };

        let (message_type, payload) = match frame {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                if e.code().closes_connection() {
                    let body = ErrorBody { code: e.code().as_str().to_string(), message: e.to_string() };
                    if let Ok(bytes) = encode_payload(&body) {
                        let _ = write_frame(&mut writer, MessageType::Error, &bytes).await;
                    }
                }
                return Err(e);
            }
            Err(_) => {
                debug!("connection idle past idle_timeout, closing");
                return Ok(());
            }
        };

        let (response_type, body) = dispatcher.handle(&mut session, message_type, &payload);
        write_frame(&mut writer, response_type, &body).await?;

        if session.state == crate::protocol::session::SessionState::Closed {
            return Ok(());
        }
    }
}
