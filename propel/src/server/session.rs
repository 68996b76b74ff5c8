use crate::{
    cache::rate_limit::LimitAction,
    engine::{Engine, executor::{CloseOutcome, OrderOutcome}},
    server::message::{ClientMessage, ServerMessage},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use propel_execution::UserId;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        Message as WsMessage,
        handshake::server::{ErrorResponse, Request, Response},
    },
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Drive one client connection: WebSocket handshake, bearer-token auth, initial account
/// snapshot, then concurrent inbound dispatch and outbound pump until disconnect or
/// shutdown.
pub async fn handle_connection(
    engine: Arc<Engine>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut token: Option<String> = None;
    let websocket = match accept_hdr_async(stream, |request: &Request, response: Response| {
        token = extract_bearer_token(request);
        Ok::<Response, ErrorResponse>(response)
    })
    .await
    {
        Ok(websocket) => websocket,
        Err(error) => {
            debug!(%peer, ?error, "client handshake failed");
            return;
        }
    };

    let (mut sink, mut source) = websocket.split();

    // Bearer token validated on open; the session carries the resolved user id
    let user_id = match token {
        Some(token) => match engine.repository.validate_session(&token, Utc::now()).await {
            Ok(Some(user_id)) => user_id,
            Ok(None) => {
                let _ = send_json(
                    &mut sink,
                    &ServerMessage::Error {
                        message: "authentication failed".to_string(),
                    },
                )
                .await;
                let _ = sink.close().await;
                return;
            }
            Err(error) => {
                warn!(%peer, ?error, "session validation unavailable");
                let _ = sink.close().await;
                return;
            }
        },
        None => {
            let _ = send_json(
                &mut sink,
                &ServerMessage::Error {
                    message: "missing bearer token".to_string(),
                },
            )
            .await;
            let _ = sink.close().await;
            return;
        }
    };

    let session_id = Uuid::new_v4();
    let accounts = engine.accounts.ids_for_user(user_id);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerMessage>();
    engine
        .sessions
        .register(session_id, user_id, accounts.iter().copied(), tx);

    info!(%session_id, %user_id, %peer, "client session opened");

    // Initial snapshot so clients render without a separate fetch
    for account_id in &accounts {
        if let Some(account) = engine.accounts.snapshot(*account_id).await {
            engine.sessions.send_to_session(
                session_id,
                ServerMessage::AccountUpdated {
                    account: (&account).into(),
                },
            );
        }
        for position in engine.positions.get_by_account(*account_id) {
            engine
                .sessions
                .send_to_session(session_id, ServerMessage::PositionUpdated { position });
        }
    }

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(message) => {
                    if send_json(&mut sink, &message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = source.next() => match inbound {
                Some(Ok(WsMessage::Text(payload))) => {
                    dispatch(&engine, session_id, user_id, &payload).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(%session_id, ?error, "client socket error");
                    break;
                }
            },
            _ = shutdown.changed() => {
                let _ = sink.close().await;
                break;
            }
        }
    }

    engine.sessions.unregister(session_id);
    info!(%session_id, "client session closed");
}

async fn send_json<Sink>(sink: &mut Sink, message: &ServerMessage) -> Result<(), ()>
where
    Sink: SinkExt<WsMessage> + Unpin,
{
    let payload = serde_json::to_string(message).map_err(|_| ())?;
    sink.send(WsMessage::Text(payload.into()))
        .await
        .map_err(|_| ())
}

/// Pull the bearer token from the `Authorization` header or a `token` query parameter.
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request.headers().get("Authorization") {
        if let Ok(value) = header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }

    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=")
                .map(|token| token.to_string())
        })
    })
}

/// Handle one inbound client message, applying the per-action rate limits.
async fn dispatch(
    engine: &Engine,
    session_id: Uuid,
    user_id: UserId,
    payload: &str,
) {
    let message = match serde_json::from_str::<ClientMessage>(payload) {
        Ok(message) => message,
        Err(error) => {
            debug!(%session_id, ?error, "malformed client message");
            engine.sessions.send_to_session(
                session_id,
                ServerMessage::Error {
                    message: "malformed message".to_string(),
                },
            );
            return;
        }
    };

    match message {
        ClientMessage::Subscribe { symbols } => {
            if !engine.limiter.check(user_id, LimitAction::Subscribe).await {
                rate_limited(engine, session_id);
                return;
            }
            engine.sessions.subscribe(session_id, &symbols);
            engine
                .sessions
                .send_to_session(session_id, ServerMessage::Subscribed { symbols });
        }
        ClientMessage::Unsubscribe { symbols } => {
            if !engine.limiter.check(user_id, LimitAction::Unsubscribe).await {
                rate_limited(engine, session_id);
                return;
            }
            engine.sessions.unsubscribe(session_id, &symbols);
            engine
                .sessions
                .send_to_session(session_id, ServerMessage::Unsubscribed { symbols });
        }
        ClientMessage::PlaceOrder { request } => {
            let client_order_id = request.client_order_id.clone();
            match engine.place_order(user_id, request).await {
                Ok(OrderOutcome::Filled { order_id, position }) => {
                    engine.sessions.send_to_session(
                        session_id,
                        ServerMessage::OrderFilled {
                            order_id,
                            client_order_id,
                            position,
                        },
                    );
                }
                Ok(OrderOutcome::Accepted { order_id })
                | Ok(OrderOutcome::Duplicate { order_id, .. }) => {
                    engine.sessions.send_to_session(
                        session_id,
                        ServerMessage::OrderAccepted {
                            order_id,
                            client_order_id,
                        },
                    );
                }
                Err(reason) => {
                    engine.sessions.send_to_session(
                        session_id,
                        ServerMessage::OrderRejected {
                            client_order_id,
                            reason,
                        },
                    );
                }
            }
        }
        ClientMessage::ClosePosition {
            position_id,
            quantity,
        } => match engine.close_position(user_id, position_id, quantity).await {
            // Close events fan out to every account session, this one included
            Ok(CloseOutcome::Closed { .. }) | Ok(CloseOutcome::AlreadyClosed) => {}
            Err(reason) => {
                engine.sessions.send_to_session(
                    session_id,
                    ServerMessage::CloseRejected {
                        position_id,
                        reason,
                    },
                );
            }
        },
        ClientMessage::ModifyTpsl {
            position_id,
            take_profit,
            stop_loss,
        } => {
            if let Err(reason) = engine
                .modify_tpsl(user_id, position_id, take_profit, stop_loss)
                .await
            {
                engine.sessions.send_to_session(
                    session_id,
                    ServerMessage::CloseRejected {
                        position_id,
                        reason,
                    },
                );
            }
        }
        ClientMessage::CancelOrder { order_id } => {
            if let Err(reason) = engine.cancel_order(user_id, order_id).await {
                engine.sessions.send_to_session(
                    session_id,
                    ServerMessage::Error {
                        message: format!("cancel failed: {reason}"),
                    },
                );
            }
        }
    }
}

fn rate_limited(engine: &Engine, session_id: Uuid) {
    engine.sessions.send_to_session(
        session_id,
        ServerMessage::Error {
            message: "rate limited".to_string(),
        },
    );
}
