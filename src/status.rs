/* --------------------------
Status event channel
    - Keeps a single websocket subscription to the server's task status stream
      and hands every decoded frame to the registered observers.
    - A snapshot request made before the handshake finishes is recorded and
      flushed exactly once when the channel opens; the open transition and
      request_all share one mutex so the request can be neither lost nor sent
      twice.
    - A channel that has closed is done for good; collaborators check
      running() and construct a fresh instance instead of reusing it.
-------------------------- */

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::client::{ClientError, TaskStatus};

/// The one client->server command: resend the status of every known task.
const SNAPSHOT_COMMAND: &str = "all";

pub type StatusObserver = Arc<dyn Fn(TaskStatus) + Send + Sync>;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Open-side of the socket plus the deferred snapshot flag. Everything that
/// touches either field takes this mutex.
#[derive(Default)]
struct Shared {
    sink: Option<WsSink>,
    request_on_open: bool,
}

pub struct StatusChannel {
    shared: Arc<Mutex<Shared>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    observers: Arc<std::sync::RwLock<Vec<StatusObserver>>>,
}

impl StatusChannel {
    /// Starts connecting immediately; the returned channel may still be in
    /// its handshake when this returns.
    pub fn open(url: String) -> Self {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let running = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let observers: Arc<std::sync::RwLock<Vec<StatusObserver>>> =
            Arc::new(std::sync::RwLock::new(Vec::new()));

        let handle = tokio::spawn(run_channel(
            url,
            shared.clone(),
            running.clone(),
            cancel.clone(),
            observers.clone(),
        ));

        Self {
            shared,
            running,
            cancel,
            handle: Mutex::new(Some(handle)),
            observers,
        }
    }

    /// Observers run in registration order, once per received frame.
    pub fn subscribe(&self, observer: StatusObserver) {
        self.observers
            .write()
            .expect("status observer list poisoned")
            .push(observer);
    }

    /// Asks the server to resend every task status. Before the handshake has
    /// finished the request is recorded and sent when the channel opens.
    pub async fn request_all(&self) -> Result<(), ClientError> {
        let mut shared = self.shared.lock().await;
        match shared.sink.as_mut() {
            Some(sink) => sink.send(Message::text(SNAPSHOT_COMMAND)).await?,
            None => shared.request_on_open = true,
        }
        Ok(())
    }

    /// True only while the channel is open. A channel that reports false is
    /// never going to run again.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cancels the channel. Idempotent; never blocks.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits until the background task has fully terminated.
    pub async fn join(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_channel(
    url: String,
    shared: Arc<Mutex<Shared>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    observers: Arc<std::sync::RwLock<Vec<StatusObserver>>>,
) {
    channel_loop(&url, &shared, &running, &cancel, &observers).await;

    // unconditional: whatever path ended the loop, the channel is not open
    let mut guard = shared.lock().await;
    guard.sink = None;
    running.store(false, Ordering::SeqCst);
}

async fn channel_loop(
    url: &str,
    shared: &Mutex<Shared>,
    running: &AtomicBool,
    cancel: &CancellationToken,
    observers: &std::sync::RwLock<Vec<StatusObserver>>,
) {
    let ws = tokio::select! {
        _ = cancel.cancelled() => {
            log::info!("status channel cancelled before the handshake finished");
            return;
        }
        connected = connect_async(url) => match connected {
            Ok((ws, _)) => ws,
            Err(e) => {
                log::error!("status channel failed to connect to {}: {}", url, e);
                return;
            }
        }
    };

    let (mut sink, mut stream) = ws.split();

    // Mark the channel open and flush a deferred snapshot request under the
    // same lock, so a concurrent request_all either lands in the flag before
    // the flush or sends on the sink after it.
    {
        let mut guard = shared.lock().await;
        if guard.request_on_open {
            guard.request_on_open = false;
            if let Err(e) = sink.send(Message::text(SNAPSHOT_COMMAND)).await {
                log::error!("status channel could not flush snapshot request: {}", e);
            }
        }
        guard.sink = Some(sink);
        running.store(true, Ordering::SeqCst);
    }
    log::info!("status channel open");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let mut guard = shared.lock().await;
                if let Some(mut sink) = guard.sink.take() {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client stop".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                }
                log::info!("status channel stopped");
                return;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(observers, text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("status channel closed by server");
                    return;
                }
                Some(Ok(_)) => {} // ping/pong/binary, nothing to do
                Some(Err(e)) => {
                    log::error!("status channel transport error: {}", e);
                    return;
                }
            }
        }
    }
}

/// Each frame is decoded on its own; a frame that does not parse is dropped
/// and the stream keeps going. A panicking observer does not stop the rest.
fn dispatch(observers: &std::sync::RwLock<Vec<StatusObserver>>, text: &str) {
    let status: TaskStatus = match serde_json::from_str(text) {
        Ok(status) => status,
        Err(e) => {
            log::warn!("dropping undecodable status frame ({}): {}", e, text);
            return;
        }
    };

    let observers = observers.read().expect("status observer list poisoned");
    for observer in observers.iter() {
        let status = status.clone();
        if catch_unwind(AssertUnwindSafe(|| observer(status))).is_err() {
            log::error!("status observer panicked");
        }
    }
}
