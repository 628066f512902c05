use uuid::Uuid;

/// One request line read from a client connection.
#[derive(Debug, Clone)]
pub struct MsgToHandle {
    pub client_id: Uuid,
    pub seq: u64,
    pub text: String,
}

impl MsgToHandle {
    pub fn new(client_id: Uuid, seq: u64, text: &str) -> Self {
        MsgToHandle {
            client_id,
            seq,
            text: text.to_string(),
        }
    }
}

/// Response line for the request with the same `seq` on that connection.
#[derive(Debug, Clone)]
pub struct MsgToRes {
    pub client_id: Uuid,
    pub seq: u64,
    pub text: String,
}

impl MsgToRes {
    pub fn new(client_id: Uuid, seq: u64, text: String) -> Self {
        MsgToRes {
            client_id,
            seq,
            text,
        }
    }
}
