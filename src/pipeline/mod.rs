//! Line-oriented TCP front end.
//!
//! Stages are tasks joined by channels: accepting hands sockets to reading,
//! reading turns each line into a [`MsgToHandle`](crate::models::MsgToHandle),
//! handling judges it, and responding writes the resulting line back. Every
//! request gets a per-connection sequence number and responses are written
//! in that order, whatever order the judging finishes in.

use std::{collections::BTreeMap, io, sync::Arc};

use dashmap::DashMap;
use serde::Serialize;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, tcp::OwnedWriteHalf},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{config::Config, core::judge::Judge};

pub mod accepting;
pub mod handling;
pub mod reading;
pub mod responding;

const CHANNEL_CAPACITY: usize = 128;

pub type Connections = Arc<DashMap<Uuid, Arc<Mutex<Connection>>>>;

#[derive(Debug)]
pub struct Connection {
    writer: OwnedWriteHalf,
    received: u64,
    next_to_write: u64,
    held: BTreeMap<u64, String>,
    reading_done: bool,
}

impl Connection {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer,
            received: 0,
            next_to_write: 0,
            held: BTreeMap::new(),
            reading_done: false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.received;
        self.received += 1;
        seq
    }

    fn hold(&mut self, seq: u64, text: String) {
        self.held.insert(seq, text);
    }

    /// Writes held responses for as long as the next one in sequence is ready.
    async fn write_ready(&mut self) -> io::Result<()> {
        while let Some(text) = self.held.remove(&self.next_to_write) {
            self.writer.write_all(text.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.next_to_write += 1;
        }
        self.writer.flush().await
    }

    /// The peer stopped sending and every request got its response.
    fn is_finished(&self) -> bool {
        self.reading_done && self.next_to_write == self.received
    }
}

/// Wires the stages together and starts accepting on `listener`.
pub fn serve(listener: TcpListener, config: Arc<Config>, judge: Arc<Judge>) -> JoinHandle<()> {
    let connections: Connections = Arc::new(DashMap::new());

    let (read_tx, read_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (msg_handle_tx, msg_handle_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (res_tx, res_rx) = mpsc::channel(CHANNEL_CAPACITY);

    responding::send_responses(connections.clone(), res_rx);
    handling::handle_messages(config, judge, res_tx.clone(), msg_handle_rx);
    reading::read_sockets(connections, read_rx, msg_handle_tx, res_tx);
    accepting::accept_connections(read_tx, listener)
}

pub(crate) fn to_line<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        tracing::error!(internal = true, error = %e, "Failed to serialize response");
        r#"{"error":{"kind":"Internal","message":"failed to serialize response"}}"#.to_string()
    })
}
