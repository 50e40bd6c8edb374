//! WebSocket streaming handler.
//!
//! Each connection holds one bus subscription rebuilt on every
//! subscribe/unsubscribe. Events are delivered in publication order for
//! the connection; a connection that falls behind its bounded queue is
//! dropped by the bus and told so with a terminal `overflow` frame.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::StreamExt;
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::channels::{filter_for, Channel};
use crate::events::{Event, EventStream};
use crate::metrics::names;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Subscribed {
        channel: String,
    },
    Unsubscribed {
        channel: String,
    },
    Event {
        #[serde(flatten)]
        event: Event,
    },
    Error {
        code: String,
        message: String,
    },
    Pong,
    Overflow,
}

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, initial: Vec<Channel>) {
    metrics::gauge!(names::WS_CONNECTIONS_ACTIVE).increment(1.0);
    let result = run_socket(socket, state, initial).await;
    metrics::gauge!(names::WS_CONNECTIONS_ACTIVE).decrement(1.0);
    if let Err(e) = result {
        tracing::debug!("WebSocket closed: {}", e);
    }
}

async fn run_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    initial: Vec<Channel>,
) -> Result<(), axum::Error> {
    let (mut sender, mut receiver) = socket.split();

    let mut channels: Vec<Channel> = Vec::new();
    let mut subscription: Option<EventStream> = None;

    for channel in initial {
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    if !channels.is_empty() {
        subscription = Some(state.bus.subscribe(filter_for(&channels)));
        for channel in &channels {
            send(&mut sender, &ServerMessage::Subscribed { channel: channel.name() }).await?;
        }
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let message = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                };
                match serde_json::from_str::<ClientMessage>(&message) {
                    Ok(ClientMessage::Ping) => {
                        send(&mut sender, &ServerMessage::Pong).await?;
                    }
                    Ok(ClientMessage::Subscribe { channel }) => {
                        match Channel::parse(&channel) {
                            Some(parsed) => {
                                if !channels.contains(&parsed) {
                                    channels.push(parsed);
                                    subscription =
                                        Some(state.bus.subscribe(filter_for(&channels)));
                                }
                                send(&mut sender, &ServerMessage::Subscribed { channel }).await?;
                            }
                            None => {
                                send(
                                    &mut sender,
                                    &ServerMessage::Error {
                                        code: "VALIDATION".to_string(),
                                        message: format!("unknown channel: {}", channel),
                                    },
                                )
                                .await?;
                            }
                        }
                    }
                    Ok(ClientMessage::Unsubscribe { channel }) => {
                        if let Some(parsed) = Channel::parse(&channel) {
                            channels.retain(|c| *c != parsed);
                            subscription = if channels.is_empty() {
                                None
                            } else {
                                Some(state.bus.subscribe(filter_for(&channels)))
                            };
                        }
                        send(&mut sender, &ServerMessage::Unsubscribed { channel }).await?;
                    }
                    Err(e) => {
                        send(
                            &mut sender,
                            &ServerMessage::Error {
                                code: "VALIDATION".to_string(),
                                message: format!("malformed message: {}", e),
                            },
                        )
                        .await?;
                    }
                }
            }

            event = recv_event(&mut subscription) => {
                match event {
                    Some(event) if event.is_overflow() => {
                        send(&mut sender, &ServerMessage::Overflow).await?;
                        break;
                    }
                    Some(event) => {
                        if channels.iter().any(|c| c.matches(&event)) {
                            send(&mut sender, &ServerMessage::Event { event }).await?;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

async fn recv_event(subscription: &mut Option<EventStream>) -> Option<Event> {
    match subscription {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

async fn send(
    sender: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).map_err(axum::Error::new)?;
    sender.send(Message::Text(text)).await
}
