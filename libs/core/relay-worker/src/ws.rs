//! WebSocket subscriber transport.
//!
//! Each connection registers with the hub and runs two pumps:
//! - the send pump writes the greeting, then drains the subscriber buffer and
//!   pings on a fixed interval
//! - the receive pump reads until close, error or the liveness window lapses
//!
//! Whichever pump ends first ends the connection, and the subscriber is
//! unregistered.

use crate::config::TransportConfig;
use crate::error::RelayError;
use crate::event::{HubEvent, Payload, StatusUpdate};
use crate::health::HealthState;
use crate::hub::HubHandle;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HealthState>) -> Response {
    let hub = state.hub.clone();
    let transport = state.transport.clone();
    ws.on_upgrade(move |socket| serve_subscriber(socket, hub, transport))
}

/// Run one subscriber connection to completion.
pub async fn serve_subscriber(socket: WebSocket, hub: HubHandle, transport: TransportConfig) {
    let subscription = match hub.register().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(error = %e, "Rejecting subscriber");
            return;
        }
    };
    let id = subscription.id;
    info!(subscriber_id = id, total = hub.subscriber_count(), "Subscriber connected");

    let greeting = HubEvent::Status(StatusUpdate::connected()).to_payload().ok();
    let (sink, stream) = socket.split();

    let mut send = tokio::spawn(send_pump(sink, subscription.receiver, greeting, transport.clone()));
    let mut recv = tokio::spawn(receive_pump(stream, transport.liveness_timeout));

    tokio::select! {
        _ = &mut send => recv.abort(),
        _ = &mut recv => send.abort(),
    }

    hub.unregister(id);
    info!(subscriber_id = id, "Subscriber disconnected");
}

async fn write<S>(sink: &mut S, message: Message, timeout: Duration) -> Result<(), RelayError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(timeout, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::Transport(e.to_string())),
        Err(_) => Err(RelayError::Transport(format!("write timed out after {timeout:?}"))),
    }
}

/// Drain `buffer` into `sink`, pinging every `ping_interval`.
///
/// Ends when the buffer is closed (eviction, unregistration or hub stop) or
/// a write fails.
pub(crate) async fn send_pump<S>(
    mut sink: S,
    mut buffer: mpsc::Receiver<Payload>,
    greeting: Option<Payload>,
    transport: TransportConfig,
) -> Result<(), RelayError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    if let Some(greeting) = greeting {
        write(&mut sink, Message::Text(greeting.to_string().into()), transport.write_timeout).await?;
    }

    let mut ping = interval_at(Instant::now() + transport.ping_interval, transport.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = buffer.recv() => match next {
                Some(payload) => {
                    write(&mut sink, Message::Text(payload.to_string().into()), transport.write_timeout).await?;
                }
                None => {
                    let _ = write(&mut sink, Message::Close(None), transport.write_timeout).await;
                    return Ok(());
                }
            },
            _ = ping.tick() => {
                write(&mut sink, Message::Ping(Bytes::new()), transport.write_timeout).await?;
            }
        }
    }
}

/// Read until the peer goes away or stays silent for `liveness`.
pub(crate) async fn receive_pump<S, E>(mut stream: S, liveness: Duration)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        match tokio::time::timeout(liveness, stream.next()).await {
            Err(_) => {
                debug!(liveness_ms = liveness.as_millis() as u64, "Subscriber silent, closing");
                return;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Subscriber read failed");
                return;
            }
            // Pongs and anything else the client sends count as liveness.
            Ok(Some(Ok(_))) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use std::convert::Infallible;
    use std::sync::Arc;

    fn text(message: &Message) -> Option<String> {
        match message {
            Message::Text(t) => Some(t.as_str().to_string()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_send_pump_greets_then_drains_then_closes() {
        let (sink, mut written) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel::<Payload>(8);
        let greeting = HubEvent::Status(StatusUpdate::connected()).to_payload().unwrap();

        tx.send(Arc::from("first")).await.unwrap();
        tx.send(Arc::from("second")).await.unwrap();
        drop(tx);

        send_pump(sink, rx, Some(greeting), TransportConfig::default())
            .await
            .unwrap();

        let greeting = written.next().await.unwrap();
        assert!(text(&greeting).unwrap().contains("\"connected\""));
        assert_eq!(text(&written.next().await.unwrap()).as_deref(), Some("first"));
        assert_eq!(text(&written.next().await.unwrap()).as_deref(), Some("second"));
        assert!(matches!(written.next().await, Some(Message::Close(None))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_pump_pings_on_interval() {
        let (sink, mut written) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel::<Payload>(8);
        let transport = TransportConfig::default().with_ping_interval(Duration::from_secs(54));

        let pump = tokio::spawn(send_pump(sink, rx, None, transport));
        tokio::time::sleep(Duration::from_secs(55)).await;
        drop(tx);
        pump.await.unwrap().unwrap();

        assert!(matches!(written.next().await, Some(Message::Ping(_))));
        assert!(matches!(written.next().await, Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn test_send_pump_stops_when_peer_gone() {
        let (sink, written) = fmpsc::unbounded::<Message>();
        drop(written);
        let (tx, rx) = mpsc::channel::<Payload>(8);
        tx.send(Arc::from("lost")).await.unwrap();

        let result = send_pump(sink, rx, None, TransportConfig::default()).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_pump_enforces_liveness() {
        let silent = futures::stream::pending::<Result<Message, Infallible>>();
        let started = Instant::now();
        receive_pump(silent, Duration::from_secs(60)).await;
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_receive_pump_ends_on_close() {
        let frames = futures::stream::iter(vec![
            Ok::<_, Infallible>(Message::Pong(Bytes::new())),
            Ok(Message::Close(None)),
            Ok(Message::Pong(Bytes::new())),
        ]);
        let mut frames = frames;
        receive_pump(&mut frames, Duration::from_secs(1)).await;
        // The frame after the close is never read.
        assert!(frames.next().await.is_some());
    }
}
