//! The two per-connection tasks: the write pump owns the sink, the read pump
//! owns the stream. Neither touches the other's half.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use parley_core::ChatService;

use crate::gateway::dispatch_frame;
use crate::hub::Hub;
use crate::session::{Outbound, Session};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PumpConfig {
    /// Deadline for a single transport write.
    pub write_timeout: Duration,
    /// Maximum silence from the peer before the connection is considered dead.
    pub liveness_timeout: Duration,
    /// Interval between keepalive pings. Must be shorter than `liveness_timeout`.
    pub heartbeat_interval: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        let liveness_timeout = Duration::from_secs(60);
        Self {
            write_timeout: Duration::from_secs(10),
            liveness_timeout,
            heartbeat_interval: liveness_timeout * 9 / 10,
        }
    }
}

/// Drive one upgraded socket until either side gives up.
pub async fn run(
    socket: WebSocket,
    session: Session,
    outbound: Outbound,
    hub: Hub,
    chat: Arc<dyn ChatService>,
    config: PumpConfig,
) {
    let (sink, stream) = socket.split();
    let user_id = session.user_id.clone();
    let connection_id = session.connection_id.clone();

    let stop = CancellationToken::new();
    let mut writer = tokio::spawn(write_pump(sink, outbound, config));
    let mut reader = tokio::spawn(read_pump(
        stream,
        session.clone(),
        hub.clone(),
        chat,
        config.liveness_timeout,
        stop.clone(),
    ));

    tokio::select! {
        _ = &mut writer => {
            // Sink is gone or the queue was closed by the hub. The reader
            // finishes the frame it is dispatching, then unregisters.
            stop.cancel();
            if timeout(config.write_timeout, &mut reader).await.is_err() {
                reader.abort();
                if let Err(e) = hub.unregister(session) {
                    debug!(user_id = %user_id, error = %e, "unregister after writer exit failed");
                }
            }
        }
        _ = &mut reader => {
            // The reader already asked the hub to unregister, which closes the
            // queue and lets the writer finish.
            if timeout(config.write_timeout, &mut writer).await.is_err() {
                writer.abort();
            }
        }
    }

    info!(user_id = %user_id, connection_id = %connection_id, "connection closed");
}

/// Sole writer to the transport.
///
/// Payloads already queued when the pump wakes are joined with `\n` into a
/// single text frame. A ping goes out every `heartbeat_interval`. When the
/// queue is closed and drained a close frame is sent.
pub async fn write_pump<S>(mut sink: S, mut outbound: Outbound, config: PumpConfig)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = outbound.recv() => {
                let Some(first) = item else {
                    trace!("outbound queue closed, sending close frame");
                    let _ = timeout(config.write_timeout, sink.send(Message::Close(None))).await;
                    break;
                };
                let text = match coalesce(first, &mut outbound) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "dropping non-UTF-8 outbound payload");
                        continue;
                    }
                };
                if !send_with_deadline(&mut sink, Message::Text(text.into()), config.write_timeout).await {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if !send_with_deadline(&mut sink, Message::Ping(Bytes::new()), config.write_timeout).await {
                    break;
                }
                trace!("sent ping");
            }
        }
    }

    if timeout(config.write_timeout, sink.close()).await.is_err() {
        debug!("transport close deadline exceeded");
    }
}

async fn send_with_deadline<S>(sink: &mut S, message: Message, deadline: Duration) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "transport write failed");
            false
        }
        Err(_) => {
            warn!(deadline_ms = deadline.as_millis() as u64, "transport write deadline exceeded");
            false
        }
    }
}

/// Join `first` with whatever is already buffered, newline-separated.
fn coalesce(first: Bytes, outbound: &mut Outbound) -> Result<String, std::string::FromUtf8Error> {
    let pending = outbound.buffered();
    if pending == 0 {
        return String::from_utf8(first.to_vec());
    }

    let mut buf = Vec::with_capacity(first.len() * (pending + 1));
    buf.extend_from_slice(&first);
    for _ in 0..pending {
        let Some(next) = outbound.try_recv() else {
            break;
        };
        buf.push(b'\n');
        buf.extend_from_slice(&next);
    }
    String::from_utf8(buf)
}

/// Sole reader of the transport. Every received frame, pongs included,
/// resets the liveness deadline. Exits on close, read error, silence or
/// `stop`, and asks the hub to unregister the session. `stop` is only
/// observed between frames, so a frame being dispatched always completes.
pub async fn read_pump<R, E>(
    mut stream: R,
    session: Session,
    hub: Hub,
    chat: Arc<dyn ChatService>,
    liveness_timeout: Duration,
    stop: CancellationToken,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!(user_id = %session.user_id, "reader stopped");
                break;
            }
            next = timeout(liveness_timeout, stream.next()) => next,
        };
        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!(user_id = %session.user_id, error = %e, "transport read failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(user_id = %session.user_id, "peer silent past liveness deadline");
                break;
            }
        };

        let result = match &message {
            Message::Text(text) => dispatch_frame(text.as_str().as_bytes(), &session, &hub, chat.as_ref()).await,
            Message::Binary(data) => dispatch_frame(data, &session, &hub, chat.as_ref()).await,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {
                trace!(user_id = %session.user_id, "keepalive");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(user_id = %session.user_id, error = %e, "hub unavailable, closing session");
            break;
        }
    }

    if let Err(e) = hub.unregister(session) {
        debug!(error = %e, "unregister after reader exit failed");
    }
}
