use crate::config::CallConfig;
use crate::error::CallError;
use crate::peer::capability::{MediaDevices, PeerFactory};
use crate::peer::types::PeerEvent;
use crate::relay::{RelayLink, RelaySubscription};
use crate::session::{CallEvent, CallState, Session};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const INTENT_CHANNEL_CAPACITY: usize = 16;

/// Намерения пользователя
enum Intent {
    StartCall(oneshot::Sender<Result<(), CallError>>),
    HangUp(oneshot::Sender<()>),
}

/// Кооперативный цикл событий одной сессии: намерения пользователя,
/// сообщения relay и события capability обрабатываются строго по одному.
pub struct CallAgent {
    session: Session,
    intents: mpsc::Receiver<Intent>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    inbound: RelaySubscription,
}

impl CallAgent {
    pub fn spawn(
        session: Session,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        inbound: RelaySubscription,
    ) -> CallHandle {
        let (intent_tx, intents) = mpsc::channel(INTENT_CHANNEL_CAPACITY);
        let events = session.subscribe();
        let state = session.watch_state();
        let agent = CallAgent {
            session,
            intents,
            peer_events,
            inbound,
        };
        let task = tokio::spawn(agent.run());
        CallHandle {
            intents: intent_tx,
            events,
            state,
            task,
        }
    }

    /// Подключает relay и запускает сессию поверх него
    pub fn launch(
        config: CallConfig,
        relay: Arc<RelayLink>,
        factory: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaDevices>,
    ) -> CallHandle {
        let inbound = relay.subscribe();
        relay.connect();
        let (session, peer_events) = Session::new(config, factory, media, relay);
        Self::spawn(session, peer_events, inbound)
    }

    async fn run(mut self) {
        tracing::debug!(session = %self.session.id(), "call agent started");
        let mut relay_open = true;
        loop {
            tokio::select! {
                intent = self.intents.recv() => match intent {
                    Some(Intent::StartCall(reply)) => {
                        let result = self.session.start_call().await;
                        let _ = reply.send(result);
                    }
                    Some(Intent::HangUp(reply)) => {
                        self.session.hang_up().await;
                        let _ = reply.send(());
                    }
                    None => break,
                },
                Some(event) = self.peer_events.recv() => {
                    self.session.on_peer_event(event).await;
                }
                msg = self.inbound.recv(), if relay_open => match msg {
                    Some(msg) => self.session.on_message(msg).await,
                    None => {
                        tracing::warn!("relay link is gone, no more inbound messages");
                        relay_open = false;
                    }
                },
            }
        }
        self.session.close_call().await;
        tracing::debug!(session = %self.session.id(), "call agent stopped");
    }
}

/// Управление звонком из приложения
pub struct CallHandle {
    intents: mpsc::Sender<Intent>,
    events: broadcast::Receiver<CallEvent>,
    state: watch::Receiver<CallState>,
    task: JoinHandle<()>,
}

impl CallHandle {
    pub async fn start_call(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.intents
            .send(Intent::StartCall(tx))
            .await
            .map_err(|_| CallError::AgentStopped)?;
        rx.await.map_err(|_| CallError::AgentStopped)?
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.intents
            .send(Intent::HangUp(tx))
            .await
            .map_err(|_| CallError::AgentStopped)?;
        rx.await.map_err(|_| CallError::AgentStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.resubscribe()
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Закрывает звонок и дожидается остановки цикла
    pub async fn shutdown(self) {
        drop(self.intents);
        if let Err(e) = self.task.await {
            tracing::warn!("call agent task failed: {e}");
        }
    }
}
