use std::sync::Arc;

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    net::{TcpStream, tcp::OwnedReadHalf},
    sync::{
        Mutex,
        mpsc::{Receiver, Sender},
    },
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    intake::ErrorResponse,
    models::{MsgToHandle, MsgToRes},
    pipeline::{Connection, Connections, to_line},
};

/// Largest request line accepted; the connection is closed after a longer one.
pub const MAX_REQUEST_BYTES: u64 = 64 * 1024 * 1024;

pub fn read_sockets(
    connections: Connections,
    mut read_rx: Receiver<TcpStream>,
    msg_handle_tx: Sender<MsgToHandle>,
    res_tx: Sender<MsgToRes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(socket) = read_rx.recv().await {
            let client_id = Uuid::new_v4();

            let (read_half, write_half) = socket.into_split();
            let connection = Arc::new(Mutex::new(Connection::new(write_half)));
            connections.insert(client_id, connection.clone());

            tokio::spawn(read_requests(
                client_id,
                read_half,
                connection,
                connections.clone(),
                msg_handle_tx.clone(),
                res_tx.clone(),
            ));
        }
    })
}

#[tracing::instrument(skip_all, fields(client = %client_id))]
async fn read_requests(
    client_id: Uuid,
    read_half: OwnedReadHalf,
    connection: Arc<Mutex<Connection>>,
    connections: Connections,
    msg_handle_tx: Sender<MsgToHandle>,
    res_tx: Sender<MsgToRes>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_REQUEST_BYTES + 1)
            .read_until(b'\n', &mut line)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read from client");
                break;
            }
        }

        if line.len() as u64 > MAX_REQUEST_BYTES {
            tracing::warn!("Request line too long, closing connection");
            let seq = connection.lock().await.next_seq();
            let response = ErrorResponse::new(
                "MalformedRequest",
                format!("request exceeds {MAX_REQUEST_BYTES} bytes"),
            );
            let _ = res_tx
                .send(MsgToRes::new(client_id, seq, to_line(&response)))
                .await;
            break;
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        let seq = connection.lock().await.next_seq();
        tracing::debug!(seq, bytes = text.len(), "Received request");
        if msg_handle_tx
            .send(MsgToHandle::new(client_id, seq, text))
            .await
            .is_err()
        {
            tracing::debug!("Handler stage is gone");
            break;
        }
    }

    let finished = {
        let mut connection = connection.lock().await;
        connection.reading_done = true;
        connection.is_finished()
    };
    if finished {
        connections.remove(&client_id);
        tracing::debug!("Connection closed");
    }
}
