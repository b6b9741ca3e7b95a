use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, State,
    },
    response::IntoResponse,
};
use delivery_api::{ClientFrame, ErrorBody, ErrorCode, ServerFrame};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::auth::Identity;
use crate::error::DispatchError;
use crate::presence::ConnectionHandle;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(stream: WebSocket, state: AppState, identity: Identity) {
    let (mut sender, mut receiver) = stream.split();
    let (handle, mut rx) = ConnectionHandle::new();
    let connection_id = handle.id();
    let presence = state.dispatcher.presence().clone();
    if let Some(previous) = presence.connect(&identity.user_id, handle) {
        previous.deliver(ServerFrame::Superseded);
    }
    info!(user_id = %identity.user_id, %connection_id, "connected");

    let hello = ServerFrame::Hello {
        user_id: identity.user_id.clone(),
    };
    if send_frame(&mut sender, &hello).await {
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let superseded = matches!(frame, ServerFrame::Superseded);
                    if !send_frame(&mut sender, &frame).await || superseded {
                        break;
                    }
                },
                incoming = receiver.next() => {
                    let reply = match incoming {
                        Some(Ok(Message::Text(text))) => handle_client_frame(&state, &identity, &text),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!(error = %e, "socket read failed");
                            break;
                        }
                    };
                    if !send_frame(&mut sender, &reply).await {
                        break;
                    }
                },
            }
        }
    }

    let _ = sender.close().await;
    if presence.disconnect(&identity.user_id, connection_id) {
        info!(user_id = %identity.user_id, %connection_id, "disconnected");
    } else {
        debug!(user_id = %identity.user_id, %connection_id, "closed superseded connection");
    }
}

async fn send_frame<S>(sender: &mut S, frame: &ServerFrame) -> bool
where
    S: SinkExt<Message> + Unpin,
{
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode frame");
            return true;
        }
    };
    sender.send(Message::Text(text)).await.is_ok()
}

fn handle_client_frame(state: &AppState, identity: &Identity, text: &str) -> ServerFrame {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            return ServerFrame::Error(ErrorBody::new(
                ErrorCode::InvalidRequest,
                format!("unreadable frame: {e}"),
            ))
        }
    };
    match frame {
        ClientFrame::Send(req) => {
            let temp_id = req.client_temp_id.clone();
            match state.dispatcher.send(identity, req) {
                Ok(outcome) => ServerFrame::Ack(outcome.message.into()),
                Err(e) => error_frame(e, temp_id),
            }
        }
        ClientFrame::MarkRead(req) => match state.dispatcher.mark_read(identity, req) {
            Ok(resp) => ServerFrame::ReadAck(resp),
            Err(e) => error_frame(e, None),
        },
        ClientFrame::Ping => ServerFrame::Pong,
    }
}

fn error_frame(e: DispatchError, temp_id: Option<String>) -> ServerFrame {
    if let DispatchError::Storage(inner) = &e {
        tracing::error!(error = %inner, "socket request failed");
    }
    ServerFrame::Error(e.body().with_temp_id(temp_id))
}
