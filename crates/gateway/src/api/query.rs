//! The `/ws/query` streaming endpoint.
//!
//! Frames are handled one at a time, in arrival order, since a session is one
//! cooperative task, so a prompt is fully streamed before the next frame
//! is read. The heartbeat timer only runs while waiting for the client:
//! probes go out after 60 s of client silence and never during active
//! traffic.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;

use arbor_domain::envelope::{ClientFrame, Envelope};

use crate::manager::users::ProcessRequest;
use crate::state::AppState;

/// Client silence before a liveness probe.
const HEARTBEAT_SILENCE: Duration = Duration::from_secs(60);

/// Delay between forwarded envelopes, so one busy session cannot starve
/// others sharing the transport.
const PACING: Duration = Duration::from_millis(5);

type WsSink = SplitSink<WebSocket, Message>;

pub async fn query_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut last_communication = Instant::now();

    loop {
        tokio::select! {
            maybe = stream.next() => {
                match maybe {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Text(raw))) => {
                        last_communication = Instant::now();
                        match serde_json::from_str::<ClientFrame>(&raw) {
                            Ok(frame) if frame.is_disconnect() => {
                                tracing::debug!("client requested disconnect");
                                break;
                            }
                            Ok(frame) => {
                                if stream_prompt(&state, frame, &mut sink).await.is_err() {
                                    break;
                                }
                                last_communication = Instant::now();
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "malformed frame on query socket");
                                let envelope =
                                    Envelope::error("", "", "", format!("protocol: {e}"));
                                if send_envelope(&mut sink, &envelope).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    // Pings are answered by axum; binary frames are not
                    // part of the protocol.
                    Some(Ok(_)) => {}
                }
            }
            _ = tokio::time::sleep_until(last_communication + HEARTBEAT_SILENCE) => {
                if send_envelope(&mut sink, &Envelope::heartbeat()).await.is_err() {
                    break;
                }
                last_communication = Instant::now();
            }
        }
    }

    let _ = sink.close().await;
}

/// Dispatch one prompt and forward the run's envelopes. `Err(())` means
/// the client is gone and the socket loop should end; dropping the
/// receiver on that path cancels the run between yields.
async fn stream_prompt(
    state: &AppState,
    frame: ClientFrame,
    sink: &mut WsSink,
) -> Result<(), ()> {
    if frame.user_id.is_empty() || frame.conversation_id.is_empty() {
        let envelope = Envelope::error(
            &frame.user_id,
            &frame.conversation_id,
            &frame.query_id,
            "protocol: user_id and conversation_id are required",
        );
        return send_envelope(sink, &envelope).await;
    }

    tracing::debug!(
        user_id = %frame.user_id,
        conversation_id = %frame.conversation_id,
        query_id = %frame.query_id,
        collections = frame.collection_names.len(),
        "query received"
    );

    let mut rx = state
        .users
        .process(ProcessRequest {
            user_id: frame.user_id.clone(),
            conversation_id: frame.conversation_id.clone(),
            query_id: frame.query_id.clone(),
            query: frame.query.clone(),
            collection_names: frame.collection_names.clone(),
            training_route: frame.route.clone(),
        })
        .await;

    while let Some(envelope) = rx.recv().await {
        send_envelope(sink, &envelope).await?;
        tokio::time::sleep(PACING).await;
    }

    Ok(())
}

async fn send_envelope(sink: &mut WsSink, envelope: &Envelope) -> Result<(), ()> {
    let raw = match serde_json::to_string(envelope) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(error = %e, "envelope serialization failed");
            return Ok(());
        }
    };
    sink.send(Message::Text(raw)).await.map_err(|_| ())
}
