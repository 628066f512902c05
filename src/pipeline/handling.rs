use std::sync::Arc;

use tokio::{
    sync::mpsc::{Receiver, Sender},
    task::JoinHandle,
};

use crate::{
    config::Config,
    core::judge::Judge,
    intake::{self, ErrorResponse, SubmissionRequest},
    models::{MsgToHandle, MsgToRes},
    pipeline::to_line,
};

/// Judges every request on its own task so one slow submission does not hold
/// back the others.
pub fn handle_messages(
    config: Arc<Config>,
    judge: Arc<Judge>,
    res_tx: Sender<MsgToRes>,
    mut msg_handle_rx: Receiver<MsgToHandle>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = msg_handle_rx.recv().await {
            let config = config.clone();
            let judge = judge.clone();
            let res_tx = res_tx.clone();

            tokio::spawn(async move {
                let text = handle_message(&msg.text, &config, &judge).await;
                if res_tx
                    .send(MsgToRes::new(msg.client_id, msg.seq, text))
                    .await
                    .is_err()
                {
                    tracing::warn!(client = %msg.client_id, "Responder stage is gone");
                }
            });
        }
    })
}

/// Turns one request line into one response line.
pub async fn handle_message(text: &str, config: &Config, judge: &Judge) -> String {
    let request: SubmissionRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::info!(error = %e, "Malformed request");
            return to_line(&ErrorResponse::malformed(&e));
        }
    };

    let submission = match intake::accept(request, config) {
        Ok(submission) => submission,
        Err(e) => {
            tracing::info!(error = %e, "Rejected submission");
            return to_line(&ErrorResponse::from(&e));
        }
    };

    match judge.judge(submission).await {
        Ok(report) => to_line(&intake::respond(&report)),
        Err(e) => {
            tracing::warn!(error = %e, "Submission not admitted");
            to_line(&ErrorResponse::from(&e))
        }
    }
}
