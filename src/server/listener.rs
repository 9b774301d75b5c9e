// src/server/listener.rs

//! The TCP accept loop and per-connection frame dispatch.

use crate::core::protocol::{RpcRequest, ServerCodec};
use crate::core::state::ServerState;
use crate::server::handlers;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Accepts connections until shutdown; each connection gets its own task.
pub async fn run(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("[{}] Listener shutting down", state.address);
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer_addr)) => {
                        debug!("[{}] Accepted connection from {}", state.address, peer_addr);
                        let state = state.clone();
                        let mut conn_shutdown = state.shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = conn_shutdown.recv() => {}
                                result = handle_connection(socket, &state) => {
                                    if let Err(e) = result {
                                        warn!(
                                            "[{}] Connection from {} ended with error: {}",
                                            state.address, peer_addr, e
                                        );
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => warn!("[{}] Failed to accept connection: {}", state.address, e),
                }
            }
        }
    }
}

/// Reads request frames until the peer hangs up. Streamed requests (upload,
/// retrieve) take over the connection for the duration of their stream.
async fn handle_connection(
    socket: TcpStream,
    state: &Arc<ServerState>,
) -> Result<(), crate::core::PrismError> {
    let mut framed = Framed::new(socket, ServerCodec::new());

    while let Some(frame) = framed.next().await {
        match frame? {
            RpcRequest::UploadVideoChunk(chunk) => {
                let reply = handlers::master::handle_upload(state, chunk, &mut framed).await;
                framed.send(reply).await?;
            }
            RpcRequest::RetrieveVideo { video_id } => {
                handlers::master::handle_retrieve(state, &mut framed, &video_id).await?;
            }
            request => {
                let reply = handlers::dispatch(state, request).await;
                framed.send(reply).await?;
            }
        }
    }
    Ok(())
}
