use crate::{engine::Engine, error::EngineError};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Inbound/outbound client message envelopes.
pub mod message;

/// Connected-session registry with subscription and account fan-out indexes.
pub mod registry;

/// Per-connection session task: handshake, auth, inbound dispatch, outbound pump.
pub mod session;

/// Accept client-channel connections until shutdown.
///
/// On shutdown the listener stops accepting; live sessions observe the same signal and
/// drain themselves.
pub async fn run_server(
    engine: Arc<Engine>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), EngineError> {
    let listener = TcpListener::bind(&engine.config.bind_addr).await?;
    info!(addr = %engine.config.bind_addr, "client channel listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(session::handle_connection(
                        Arc::clone(&engine),
                        stream,
                        peer,
                        shutdown.clone(),
                    ));
                }
                Err(error) => warn!(?error, "client channel accept failed"),
            },
            _ = shutdown.changed() => {
                info!("client channel listener stopped");
                return Ok(());
            }
        }
    }
}
