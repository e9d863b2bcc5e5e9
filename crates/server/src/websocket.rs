use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskloom_core::{ProgressEvent, Run, RunId, RunManager, RunStatus, StepStatus};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::AppState;

/// Messages pushed to WebSocket clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Subscription accepted, with the run as it stands right now
    Subscribed { run: Run },
    /// A step changed state
    StepUpdate(ProgressEvent),
    /// The run reached a terminal state; no further messages for it follow
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        completed_at: Option<DateTime<Utc>>,
    },
    Error { message: String },
    Pong,
}

/// Requests sent by WebSocket clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WsRequest {
    /// Follow the progress of one run
    SubscribeRun { run_id: String },
    /// Stop following the current run
    Unsubscribe,
    Ping,
}

/// WebSocket handler for run progress
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(64);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to serialize WS message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut subscription: Option<JoinHandle<()>> = None;

    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                tracing::debug!("Received WS message: {}", text.as_str());

                let request = match serde_json::from_str::<WsRequest>(text.as_str()) {
                    Ok(request) => request,
                    Err(e) => {
                        let _ = tx
                            .send(WsMessage::Error {
                                message: format!("Invalid request: {}", e),
                            })
                            .await;
                        continue;
                    }
                };

                match request {
                    WsRequest::SubscribeRun { run_id } => {
                        if let Some(previous) = subscription.take() {
                            previous.abort();
                        }
                        match run_id.parse::<RunId>() {
                            Ok(run_id) => {
                                tracing::info!("Client subscribed to run {}", run_id);
                                subscription = Some(tokio::spawn(follow_run(
                                    state.runs.clone(),
                                    run_id,
                                    tx.clone(),
                                )));
                            }
                            Err(_) => {
                                let _ = tx
                                    .send(WsMessage::Error {
                                        message: format!("Invalid run ID: {}", run_id),
                                    })
                                    .await;
                            }
                        }
                    }
                    WsRequest::Unsubscribe => {
                        if let Some(previous) = subscription.take() {
                            previous.abort();
                        }
                    }
                    WsRequest::Ping => {
                        let _ = tx.send(WsMessage::Pong).await;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket connection closed");
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    if let Some(subscription) = subscription {
        subscription.abort();
    }
    drop(tx);
    let _ = writer.await;

    tracing::info!("WebSocket connection terminated");
}

/// Stream one run's progress into `tx` until the run finishes
async fn follow_run(runs: Arc<RunManager>, run_id: RunId, tx: mpsc::Sender<WsMessage>) {
    // Subscribe before taking the snapshot so no event falls between the two
    let receiver = runs.subscribe(run_id).await;

    let Some(run) = runs.get(run_id).await else {
        let _ = tx
            .send(WsMessage::Error {
                message: format!("run {} not found", run_id),
            })
            .await;
        return;
    };

    if tx.send(WsMessage::Subscribed { run }).await.is_err() {
        return;
    }

    if let Some(mut receiver) = receiver {
        tracing::debug!(
            "Run {} has {} progress subscribers",
            run_id,
            runs.hub().subscriber_count(run_id)
        );
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if tx.send(WsMessage::StepUpdate(event)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "WS subscriber for run {} lagged, {} events dropped",
                        run_id,
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    if let Some(run) = runs.wait(run_id).await {
        tracing::info!(
            "Run {} finished for subscriber: {} completed, {} failed, {} cancelled",
            run_id,
            run.count(StepStatus::Completed),
            run.count(StepStatus::Failed),
            run.count(StepStatus::Cancelled)
        );
        let _ = tx
            .send(WsMessage::RunFinished {
                run_id,
                status: run.status,
                completed_at: run.completed_at,
            })
            .await;
    }
}
