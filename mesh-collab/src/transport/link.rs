//! Supervised WebSocket link shared by the relay- and helper-backed transports.
//!
//! A [`Link`] owns one supervisor task. The task dials the endpoint, pumps
//! frames while the socket is up, and walks the [`Reconnect`] machine when
//! it drops. The task is the only writer to the socket; everyone else queues
//! text frames through the [`LinkWriter`] handed to [`LinkHandler::on_open`].

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::backoff::{LinkInput, LinkState, Reconnect, ReconnectPolicy};
use super::TransportError;

pub(crate) type LinkWriter = mpsc::UnboundedSender<String>;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callbacks from the supervisor task. Called in order, never concurrently.
pub(crate) trait LinkHandler: Send + Sync + 'static {
    fn on_open(&self, writer: LinkWriter);
    fn on_text(&self, text: &str);
    fn on_close(&self);
}

pub(crate) struct Link {
    url: String,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<LinkState>>,
    shutdown: Arc<watch::Sender<bool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    pub fn new(url: String, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(LinkState::Idle);
        let (shutdown, _) = watch::channel(false);
        Self {
            url,
            policy,
            state: Arc::new(state),
            shutdown: Arc::new(shutdown),
            task: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Start the supervisor if it is not running and wait until the link is
    /// up or retries are exhausted.
    pub async fn connect<H: LinkHandler>(&self, handler: Arc<H>) -> Result<(), TransportError> {
        if self.is_shut_down() {
            return Err(TransportError::Destroyed);
        }

        let mut state_rx = {
            let mut task = self.task.lock();
            let running = task.as_ref().is_some_and(|t| !t.is_finished())
                && self.state() != LinkState::Failed;
            if !running {
                self.state.send_replace(LinkState::Connecting);
                *task = Some(tokio::spawn(supervise(
                    self.url.clone(),
                    self.policy,
                    handler,
                    self.state.clone(),
                    self.shutdown.subscribe(),
                )));
            }
            self.state.subscribe()
        };

        loop {
            match *state_rx.borrow_and_update() {
                LinkState::Connected => return Ok(()),
                LinkState::Failed => {
                    return Err(TransportError::Exhausted {
                        attempts: self.policy.max_attempts,
                    })
                }
                LinkState::Idle => return Err(TransportError::Destroyed),
                LinkState::Connecting | LinkState::Backoff(_) => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(TransportError::Destroyed);
            }
        }
    }

    /// Stop the supervisor, cancelling any pending backoff timer.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Link supervisor for {} ended abnormally: {e}", self.url);
            }
        }
        self.state.send_replace(LinkState::Idle);
    }
}

async fn supervise<H: LinkHandler>(
    url: String,
    policy: ReconnectPolicy,
    handler: Arc<H>,
    state: Arc<watch::Sender<LinkState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut machine = Reconnect::new(policy);
    machine.on(LinkInput::Connect);

    loop {
        let attempt = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = stop_requested(&mut shutdown) => return,
        };

        match attempt {
            Ok((socket, _)) => {
                let (writer, outbound) = mpsc::unbounded_channel();
                handler.on_open(writer);
                state.send_replace(machine.on(LinkInput::Opened));
                log::info!("Link to {url} established");

                let stopped = pump(socket, outbound, handler.as_ref(), &mut shutdown).await;
                handler.on_close();
                if stopped {
                    return;
                }
                log::warn!("Link to {url} lost");
            }
            Err(e) => log::warn!("Connecting to {url} failed: {e}"),
        }

        let next = machine.on(LinkInput::Lost);
        if next == LinkState::Failed {
            log::error!("Giving up on {url} after {} attempts", policy.max_attempts);
            state.send_replace(next);
            return;
        }
        state.send_replace(next);

        let delay = machine.pending_delay().unwrap_or_default();
        log::debug!("Retrying {url} in {delay:?} ({next:?})");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_requested(&mut shutdown) => return,
        }
        state.send_replace(machine.on(LinkInput::TimerElapsed));
    }
}

/// Move frames until the socket drops (`false`) or shutdown is requested (`true`).
async fn pump<H: LinkHandler>(
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<String>,
    handler: &H,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::text(text)).await {
                    log::warn!("Link write failed: {e}");
                    return false;
                }
            }

            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => handler.on_text(text.as_str()),
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Link read failed: {e}");
                    return false;
                }
            },

            _ = stop_requested(shutdown) => {
                let _ = sink.send(Message::Close(None)).await;
                return true;
            }
        }
    }
}

/// Resolves once shutdown is requested or the link owner is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
