use std::time::Duration;

use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::Sender,
    task::JoinHandle,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[tracing::instrument(skip_all)]
pub fn accept_connections(read_tx: Sender<TcpStream>, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; give in-flight connections time to close.
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            tracing::debug!(%peer, "Accepted connection");

            if read_tx.send(socket).await.is_err() {
                tracing::debug!("Reader stage is gone, stop accepting");
                return;
            }
        }
    })
}
