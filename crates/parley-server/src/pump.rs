//! The two halves of a live connection: an outbound pump that is the sole
//! writer to the socket, and an inbound pump that reads frames and hands
//! them to a [`FrameHandler`] one at a time.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message as WsMessage;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, warn};

use parley_core::envelope::Envelope;
use parley_core::ProtocolError;
use parley_settings::SessionSettings;

use crate::errors::{ChatError, TransportReason};
use crate::registry::Registry;
use crate::session::Session;

/// Per-connection limits and timers.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub outbound_capacity: usize,
    pub max_frame_bytes: usize,
    pub read_deadline: Duration,
    pub ping_interval: Duration,
    pub write_deadline: Duration,
    /// How long teardown waits for the outbound pump to flush.
    pub close_grace: Duration,
}

impl From<&SessionSettings> for SessionConfig {
    fn from(s: &SessionSettings) -> Self {
        Self {
            outbound_capacity: s.outbound_capacity,
            max_frame_bytes: s.max_frame_bytes,
            read_deadline: s.read_deadline(),
            ping_interval: s.ping_interval(),
            write_deadline: s.write_deadline(),
            close_grace: s.close_grace(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

/// Receives every inbound text frame of a session, in arrival order.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_frame(&self, session: &Arc<Session>, frame: &str);

    /// Called once per session during teardown, before it leaves the registry.
    async fn on_disconnect(&self, _session: &Arc<Session>) {}
}

fn transport_error(session: &Session, reason: TransportReason) -> ChatError {
    ChatError::Transport {
        connection_id: session.id().clone(),
        reason,
    }
}

async fn write<S>(sink: &mut S, message: WsMessage, deadline: Duration) -> Result<(), TransportReason>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    match time::timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "socket write failed");
            Err(TransportReason::WriteFailed)
        }
        Err(_) => Err(TransportReason::WriteTimeout),
    }
}

/// Drain the session's outbound queue into `sink`, pinging every
/// `ping_interval`. Ends with a close frame once the queue is released, or
/// closes the session if a write fails or misses its deadline.
#[instrument(skip_all, fields(connection_id = %session.id()))]
pub async fn run_outbound<S>(
    session: Arc<Session>,
    mut rx: mpsc::Receiver<Arc<String>>,
    mut sink: S,
    ping_interval: Duration,
    write_deadline: Duration,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    let mut ping = time::interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        let result = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => {
                    let text = String::clone(&frame);
                    write(&mut sink, WsMessage::Text(text.into()), write_deadline).await
                }
                None => {
                    // Queue released by close(): say goodbye and stop.
                    let _ = write(&mut sink, WsMessage::Close(None), write_deadline).await;
                    debug!("outbound pump finished");
                    return;
                }
            },
            _ = ping.tick() => write(&mut sink, WsMessage::Ping(Bytes::new()), write_deadline).await,
        };

        if let Err(reason) = result {
            warn!(%reason, "outbound pump giving up");
            let _ = session.begin_close();
            let _ = session.close();
            return;
        }
    }
}

/// Read frames until the peer goes away, the read deadline passes, or the
/// session is closed from elsewhere. Any inbound frame resets the deadline.
pub async fn run_inbound<St, E>(
    session: &Arc<Session>,
    stream: &mut St,
    handler: &dyn FrameHandler,
    config: &SessionConfig,
) -> Result<(), ChatError>
where
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            biased;
            () = session.closed() => return Ok(()),
            next = time::timeout(config.read_deadline, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => return Err(transport_error(session, TransportReason::ReadTimeout)),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => {
                debug!(connection_id = %session.id(), error = %e, "socket read failed");
                return Err(transport_error(session, TransportReason::ReadFailed));
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => {
                check_size(session, text.len(), config.max_frame_bytes)?;
                handler.handle_frame(session, text.as_str()).await;
            }
            WsMessage::Binary(data) => {
                check_size(session, data.len(), config.max_frame_bytes)?;
                let err = ChatError::from(ProtocolError::BinaryFrame);
                let _ = session.send_envelope(&Envelope::error(err.code(), err.to_string()));
            }
            WsMessage::Close(_) => {
                debug!(connection_id = %session.id(), "peer sent close frame");
                return Ok(());
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }
}

fn check_size(session: &Session, size: usize, limit: usize) -> Result<(), ChatError> {
    if size > limit {
        return Err(transport_error(session, TransportReason::FrameTooLarge { size, limit }));
    }
    Ok(())
}

/// Run a session from upgrade to teardown.
///
/// Registers and opens the session, spawns the outbound pump, and runs the
/// inbound pump on the current task. Once inbound stops, the session moves
/// to CLOSING, leaves the registry and is closed; the outbound pump then
/// gets `close_grace` to flush before it is aborted.
#[instrument(skip_all, fields(connection_id = %session.id()))]
pub async fn drive<Si, St, E>(
    session: Arc<Session>,
    rx: mpsc::Receiver<Arc<String>>,
    sink: Si,
    mut stream: St,
    registry: &Registry,
    handler: Arc<dyn FrameHandler>,
    config: &SessionConfig,
) where
    Si: Sink<WsMessage> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    let _ = registry.register(Arc::clone(&session));
    let _ = session.open();
    info!("client connected");

    let outbound = tokio::spawn(run_outbound(
        Arc::clone(&session),
        rx,
        sink,
        config.ping_interval,
        config.write_deadline,
    ));

    match run_inbound(&session, &mut stream, handler.as_ref(), config).await {
        Ok(()) => info!(age_ms = session.age().as_millis() as u64, "client disconnected"),
        Err(e) => warn!(error = %e, "connection terminated"),
    }

    let _ = session.begin_close();
    handler.on_disconnect(&session).await;
    let _ = registry.unregister(session.id());
    let _ = session.close();

    let abort = outbound.abort_handle();
    if time::timeout(config.close_grace, outbound).await.is_err() {
        debug!("outbound pump did not flush in time, aborting");
        abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::session::SessionState;

    type ClientTx = fmpsc::UnboundedSender<Result<WsMessage, io::Error>>;
    type ClientRx = fmpsc::UnboundedReceiver<Result<WsMessage, io::Error>>;

    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<String>>,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl FrameHandler for Echo {
        async fn handle_frame(&self, session: &Arc<Session>, frame: &str) {
            self.seen.lock().push(frame.to_string());
            let _ = session.send_message(Arc::new(format!("echo:{frame}")));
        }

        async fn on_disconnect(&self, _session: &Arc<Session>) {
            let _ = self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            outbound_capacity: 8,
            max_frame_bytes: 64,
            read_deadline: Duration::from_secs(5),
            ping_interval: Duration::from_secs(60),
            write_deadline: Duration::from_secs(1),
            close_grace: Duration::from_secs(1),
        }
    }

    fn client() -> (ClientTx, ClientRx) {
        fmpsc::unbounded()
    }

    fn text(s: &str) -> WsMessage {
        WsMessage::Text(s.to_string().into())
    }

    fn expect_text(message: Option<WsMessage>) -> String {
        match message {
            Some(WsMessage::Text(t)) => t.as_str().to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn outbound_writes_in_order_then_closes() {
        let (session, rx) = Session::new(8);
        let (sink, mut written) = fmpsc::unbounded::<WsMessage>();
        session.send_message(Arc::new("one".into())).unwrap();
        session.send_message(Arc::new("two".into())).unwrap();
        let _ = session.close();

        run_outbound(session, rx, sink, Duration::from_secs(60), Duration::from_secs(1)).await;

        assert_eq!(expect_text(written.next().await), "one");
        assert_eq!(expect_text(written.next().await), "two");
        assert!(matches!(written.next().await, Some(WsMessage::Close(None))));
        assert!(written.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_pings_on_interval() {
        let (session, rx) = Session::new(8);
        let (sink, mut written) = fmpsc::unbounded::<WsMessage>();
        let pump = tokio::spawn(run_outbound(
            session.clone(),
            rx,
            sink,
            Duration::from_secs(30),
            Duration::from_secs(1),
        ));

        assert!(matches!(written.next().await, Some(WsMessage::Ping(_))));
        let _ = session.close();
        pump.await.unwrap();
        assert!(matches!(written.next().await, Some(WsMessage::Close(None))));
    }

    #[tokio::test]
    async fn outbound_write_failure_closes_session() {
        let (session, rx) = Session::new(8);
        let (sink, written) = fmpsc::unbounded::<WsMessage>();
        drop(written);
        session.open();
        session.send_message(Arc::new("lost".into())).unwrap();

        run_outbound(session.clone(), rx, sink, Duration::from_secs(60), Duration::from_secs(1)).await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn inbound_rejects_oversized_frame() {
        let (session, _rx) = Session::new(8);
        let (tx, mut stream) = client();
        tx.unbounded_send(Ok(text(&"x".repeat(65)))).unwrap();
        let handler = Echo::default();

        let err = run_inbound(&session, &mut stream, &handler, &config())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::Transport {
                reason: TransportReason::FrameTooLarge { size: 65, limit: 64 },
                ..
            }
        ));
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn inbound_answers_binary_with_error_envelope() {
        let (session, mut rx) = Session::new(8);
        session.open();
        let (tx, mut stream) = client();
        tx.unbounded_send(Ok(WsMessage::Binary(Bytes::from_static(b"\x01\x02"))))
            .unwrap();
        drop(tx);

        run_inbound(&session, &mut stream, &Echo::default(), &config())
            .await
            .unwrap();
        let env = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(env.kind, "error");
        assert_eq!(env.data["code"], "PROTOCOL_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_times_out_without_traffic() {
        let (session, _rx) = Session::new(8);
        let (_tx, mut stream) = client();

        let err = run_inbound(&session, &mut stream, &Echo::default(), &config())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::Transport {
                reason: TransportReason::ReadTimeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn inbound_stops_when_session_closes() {
        let (session, _rx) = Session::new(8);
        let (_tx, mut stream) = client();
        let closer = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = closer.close();
        });

        run_inbound(&session, &mut stream, &Echo::default(), &config())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drive_runs_full_lifecycle() {
        let (session, rx) = Session::new(8);
        let (sink, mut written) = fmpsc::unbounded::<WsMessage>();
        let (tx, stream) = client();
        let registry = Arc::new(Registry::new());
        let handler = Arc::new(Echo::default());

        let task = tokio::spawn({
            let session = session.clone();
            let registry = registry.clone();
            let handler: Arc<dyn FrameHandler> = handler.clone();
            async move { drive(session, rx, sink, stream, &registry, handler, &config()).await }
        });

        tx.unbounded_send(Ok(text("hi"))).unwrap();
        assert_eq!(expect_text(written.next().await), "echo:hi");
        assert_eq!(registry.count(), 1);
        assert!(session.is_open());

        drop(tx);
        task.await.unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(registry.count(), 0);
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(*handler.seen.lock(), vec!["hi".to_string()]);
        assert!(matches!(written.next().await, Some(WsMessage::Close(None))));
    }
}
