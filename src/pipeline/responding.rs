use tokio::{sync::mpsc::Receiver, task::JoinHandle};

use crate::{models::MsgToRes, pipeline::Connections};

pub fn send_responses(connections: Connections, mut res_rx: Receiver<MsgToRes>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = res_rx.recv().await {
            tokio::spawn(deliver(connections.clone(), msg));
        }
    })
}

#[tracing::instrument(skip_all, fields(client = %msg.client_id, seq = msg.seq))]
async fn deliver(connections: Connections, msg: MsgToRes) {
    let Some(connection) = connections
        .get(&msg.client_id)
        .map(|entry| entry.value().clone())
    else {
        tracing::debug!("Connection already closed, dropping response");
        return;
    };

    let mut connection = connection.lock().await;
    connection.hold(msg.seq, msg.text);
    let written = connection.write_ready().await;
    let finished = connection.is_finished();
    drop(connection);

    match written {
        Err(e) => {
            tracing::warn!(error = %e, "Failed to write to client");
            connections.remove(&msg.client_id);
        }
        Ok(()) if finished => {
            connections.remove(&msg.client_id);
            tracing::debug!("Connection closed");
        }
        Ok(()) => {}
    }
}
