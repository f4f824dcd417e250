//! Постоянный WebSocket-канал до сигнального relay.
//!
//! Канал сам переподключается при любом обрыве. У каждого подписчика своя
//! неограниченная очередь, так что подписка переживает реконнект и не теряет
//! сообщений, пока подписчик занят.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::signaling::Message;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Исходящая сторона relay, как её видит сигнальный автомат
pub trait SignalSender: Send + Sync {
    /// Не блокируется и не сообщает о доставке
    fn send(&self, msg: &Message);
}

type Outbound = Option<mpsc::UnboundedSender<String>>;

/// Очереди подписчиков; закрытые выбрасываются при следующей рассылке
type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<Message>>>>;

pub struct RelayLink {
    url: Url,
    config: RelayConfig,
    inbound: Subscribers,
    /// Some, пока соединение открыто
    outbound: Arc<watch::Sender<Outbound>>,
    supervisor: OnceCell<JoinHandle<()>>,
}

impl RelayLink {
    pub fn new(config: RelayConfig) -> Result<Arc<Self>, RelayError> {
        let url = config.parsed_url()?;
        let (outbound, _) = watch::channel(None);
        Ok(Arc::new(Self {
            url,
            config,
            inbound: Arc::default(),
            outbound: Arc::new(outbound),
            supervisor: OnceCell::new(),
        }))
    }

    /// Запускает цикл подключения. Повторный вызов ничего не делает.
    pub fn connect(&self) {
        self.supervisor.get_or_init(|| {
            tracing::debug!(url = %self.url, "starting relay link");
            tokio::spawn(supervise(
                self.url.clone(),
                self.config.clone(),
                self.inbound.clone(),
                self.outbound.clone(),
            ))
        });
    }

    pub fn subscribe(&self) -> RelaySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.inbound.lock() {
            subscribers.push(tx);
        }
        RelaySubscription { rx }
    }

    /// Останавливает канал насовсем
    pub fn close(&self) {
        if let Some(handle) = self.supervisor.get() {
            handle.abort();
        }
        self.outbound.send_replace(None);
    }
}

impl SignalSender for RelayLink {
    fn send(&self, msg: &Message) {
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("failed to encode {} message: {e}", msg.kind());
                return;
            }
        };
        let outbound = self.outbound.borrow().clone();
        let delivered = match outbound {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        };
        if delivered {
            tracing::debug!("sending message: {}", msg.kind());
        } else {
            tracing::warn!("relay channel is not open, dropping {} message", msg.kind());
        }
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get() {
            handle.abort();
        }
    }
}

/// Ленивая бесконечная последовательность входящих сообщений
pub struct RelaySubscription {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl RelaySubscription {
    /// `None` только когда RelayLink уничтожен
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl From<mpsc::UnboundedReceiver<Message>> for RelaySubscription {
    fn from(rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { rx }
    }
}

async fn supervise(
    url: Url,
    config: RelayConfig,
    inbound: Subscribers,
    outbound: Arc<watch::Sender<Outbound>>,
) {
    let mut delay = config.reconnect_delay_initial;
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                tracing::info!(url = %url, "relay: connection OK");
                delay = config.reconnect_delay_initial;
                serve(ws, &inbound, &outbound).await;
                // после обрыва переподключаемся сразу
                tracing::info!(url = %url, "relay: connection closed, reconnecting");
            }
            Err(e) => {
                tracing::warn!(url = %url, "relay: connect failed: {e}, retry in {delay:?}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(config.reconnect_delay_max);
            }
        }
    }
}

async fn serve(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    inbound: &Subscribers,
    outbound: &watch::Sender<Outbound>,
) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    outbound.send_replace(Some(tx));

    loop {
        tokio::select! {
            Some(text) = rx.recv() => {
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    tracing::warn!("relay: write failed: {e}");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => dispatch(&text, inbound),
                Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => dispatch(&text, inbound),
                    Err(_) => tracing::warn!("relay: dropping non-utf8 binary frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::debug!("relay: close frame {frame:?}");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("relay: read failed: {e}");
                    break;
                }
                None => break,
            }
        }
    }

    outbound.send_replace(None);
}

fn dispatch(text: &str, inbound: &Subscribers) {
    let msg = match Message::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("relay: undecodable message: {e}");
            return;
        }
    };
    tracing::debug!("Received message of type: {}", msg.kind());
    if let Ok(mut subscribers) = inbound.lock() {
        subscribers.retain(|tx| tx.send(msg.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_while_closed_is_silent() {
        let link = RelayLink::new(RelayConfig::with_url("ws://127.0.0.1:9")).unwrap();
        link.send(&Message::Hangup);
        link.close();
    }

    #[test]
    fn rejects_non_websocket_url() {
        assert!(matches!(
            RelayLink::new(RelayConfig::with_url("ftp://relay")),
            Err(RelayError::Config(_))
        ));
    }

    #[tokio::test]
    async fn subscribers_see_the_same_order() {
        let link = RelayLink::new(RelayConfig::default()).unwrap();
        let mut first = link.subscribe();
        let mut second = link.subscribe();
        dispatch(r#"{"type":"hangup"}"#, &link.inbound);
        dispatch("garbage", &link.inbound);
        dispatch(r#"{"type":"bogus","data":null}"#, &link.inbound);

        for sub in [&mut first, &mut second] {
            assert_eq!(sub.recv().await, Some(Message::Hangup));
            assert_eq!(sub.recv().await.map(|m| m.kind().to_string()), Some("bogus".into()));
        }
    }

    #[tokio::test]
    async fn busy_subscriber_loses_nothing() {
        let link = RelayLink::new(RelayConfig::default()).unwrap();
        let mut sub = link.subscribe();
        for i in 0..200 {
            let raw = format!(
                r#"{{"type":"ice-candidate","data":{{"candidate":"c{i}","sdpMid":"0","sdpMLineIndex":0}}}}"#
            );
            dispatch(&raw, &link.inbound);
        }

        for i in 0..200 {
            match sub.recv().await {
                Some(Message::IceCandidate(c)) => assert_eq!(c.candidate, format!("c{i}")),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_is_forgotten() {
        let link = RelayLink::new(RelayConfig::default()).unwrap();
        let mut kept = link.subscribe();
        drop(link.subscribe());
        dispatch(r#"{"type":"hangup"}"#, &link.inbound);

        assert_eq!(link.inbound.lock().unwrap().len(), 1);
        assert_eq!(kept.recv().await, Some(Message::Hangup));
    }
}
