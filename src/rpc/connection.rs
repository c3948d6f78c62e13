use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::rpc::codec::{Frame, FrameBody};
use crate::rpc::{Command, RemoteCall, Responder};

type Pending = HashMap<u64, oneshot::Sender<std::result::Result<(), String>>>;

/// One end of a symmetric command connection.
///
/// A reader task dispatches inbound requests to the [`Responder`] (each on
/// its own task, so a slow `PerformJob` does not hold up the others) and
/// completes outbound calls as their responses arrive. A writer task owns
/// the sink.
pub struct Connection {
    id: Uuid,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<Pending>,
    closed: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl Connection {
    pub fn spawn<T>(io: T, responder: Arc<dyn Responder>) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut sink, mut stream) = Framed::new(io, LengthDelimitedCodec::new()).split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<Frame>();
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            next_id: AtomicU64::new(1),
            outbound,
            pending: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });

        let closed = conn.closed.clone();
        let id = conn.id;
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = closed.cancelled() => break,
                };
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(conn = %id, error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(bytes).await {
                    tracing::debug!(conn = %id, error = %e, "Write failed");
                    break;
                }
            }
            closed.cancel();
            let _ = sink.close().await;
        });

        let reader = conn.clone();
        tokio::spawn(async move {
            responder.connected(&reader).await;
            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    _ = reader.closed.cancelled() => break,
                };
                let frame = match item {
                    Some(Ok(buf)) => match Frame::decode(&buf) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(conn = %reader.id, error = %e, "Dropping connection after bad frame");
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        tracing::debug!(conn = %reader.id, error = %e, "Read failed");
                        break;
                    }
                    None => break,
                };
                reader.dispatch(frame, &responder);
            }
            reader.shutdown();
            tracing::debug!(conn = %reader.id, "Connection closed");
            responder.disconnected(&reader).await;
        });

        conn
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has shut down.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Stop both tasks. Outstanding calls fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(self: &Arc<Self>, frame: Frame, responder: &Arc<dyn Responder>) {
        let id = frame.id;
        match frame.body {
            FrameBody::Request(command) => {
                let conn = self.clone();
                let responder = responder.clone();
                tokio::spawn(async move {
                    let name = command.name();
                    let result = responder
                        .respond(&conn, command)
                        .await
                        .map_err(|e| e.to_string());
                    if let Err(e) = &result {
                        tracing::debug!(conn = %conn.id, command = name, error = %e, "Command failed");
                    }
                    let _ = conn.outbound.send(Frame::response(id, result));
                });
            }
            FrameBody::Response(result) => match self.pending().remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(result);
                }
                None => {
                    tracing::warn!(conn = %self.id, id, "Response to unknown request");
                }
            },
        }
    }

    fn shutdown(&self) {
        self.closed.cancel();
        // Dropping the senders fails every waiting call.
        self.pending().clear();
    }
}

#[async_trait]
impl RemoteCall for Connection {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn call(&self, command: Command) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        if self.is_closed() || self.outbound.send(Frame::request(id, command)).is_err() {
            self.pending().remove(&id);
            return Err(QueueError::ConnectionClosed);
        }
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(QueueError::Remote(message)),
            Err(_) => Err(QueueError::ConnectionClosed),
        }
    }
}

/// Open a TCP connection to `addr`.
pub async fn connect<A: ToSocketAddrs>(
    addr: A,
    responder: Arc<dyn Responder>,
) -> Result<Arc<Connection>> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    tracing::debug!(addr = %stream.peer_addr()?, "Connected");
    Ok(Connection::spawn(stream, responder))
}

/// Accept connections on `listener` until `cancel` fires.
pub async fn serve(listener: TcpListener, responder: Arc<dyn Responder>, cancel: CancellationToken) {
    loop {
        let (stream, addr) = match tokio::select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => break,
        } {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(addr = %addr, error = %e, "Failed to set NODELAY");
        }
        tracing::debug!(addr = %addr, "Accepted connection");
        let conn = Connection::spawn(stream, responder.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => conn.close(),
                _ = conn.closed() => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Acknowledges `EnqueuedJob`, rejects everything else, and counts
    /// disconnects.
    #[derive(Default)]
    struct Echo {
        disconnects: AtomicU64,
    }

    #[async_trait]
    impl Responder for Echo {
        async fn respond(&self, _conn: &Arc<Connection>, command: Command) -> Result<()> {
            match command {
                Command::EnqueuedJob => Ok(()),
                other => Err(QueueError::UnexpectedCommand(other.name())),
            }
        }

        async fn disconnected(&self, _conn: &Arc<Connection>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pair() -> (Arc<Connection>, Arc<Connection>, Arc<Echo>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let echo = Arc::new(Echo::default());
        let left = Connection::spawn(a, echo.clone());
        let right = Connection::spawn(b, echo.clone());
        (left, right, echo)
    }

    #[tokio::test]
    async fn call_is_acknowledged() {
        let (left, right, _) = pair();
        left.call(Command::EnqueuedJob).await.unwrap();
        right.call(Command::EnqueuedJob).await.unwrap();
    }

    #[tokio::test]
    async fn remote_error_is_returned() {
        let (left, _right, _) = pair();
        let err = left
            .call(Command::ReportLoad { load: 3 })
            .await
            .unwrap_err();
        match err {
            QueueError::Remote(message) => assert!(message.contains("ReportLoad")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn closing_fails_calls_and_notifies() {
        let (left, right, echo) = pair();
        right.close();

        tokio::time::timeout(Duration::from_secs(5), async {
            while echo.disconnects.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(right.is_closed());
        assert!(left.is_closed());
        assert!(matches!(
            left.call(Command::EnqueuedJob).await,
            Err(QueueError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Arc::new(Echo::default()), cancel.clone()));

        let conn = connect(addr, Arc::new(Echo::default())).await.unwrap();
        conn.call(Command::EnqueuedJob).await.unwrap();

        cancel.cancel();
        server.await.unwrap();
    }
}
