use crate::error::CallError;
use crate::logger::log;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Внешний pub/sub relay: именованные broadcast-каналы, best-effort доставка.
/// Переносит непрозрачные закодированные строки (см. `signaling::encode`),
/// содержимое transport-слоем не интерпретируется.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Подписка на канал; сообщения приходят через возвращённый handle
    async fn subscribe(&self, channel: &str) -> Result<RelaySubscription, CallError>;

    /// Broadcast всем текущим подписчикам канала
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CallError>;
}

/// Активная подписка; отписка идемпотентна и выполняется также при Drop
pub struct RelaySubscription {
    rx: mpsc::UnboundedReceiver<String>,
    unsub: Option<Box<dyn FnOnce() + Send>>,
}

impl RelaySubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<String>, unsub: Box<dyn FnOnce() + Send>) -> Self {
        RelaySubscription {
            rx,
            unsub: Some(unsub),
        }
    }

    /// None, relay закрыл канал
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn unsubscribe(&mut self) {
        if let Some(unsub) = self.unsub.take() {
            unsub();
        }
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

type ChannelMap = HashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>;

/// Loopback-relay в памяти процесса: используется тестами и демо,
/// продакшен подключает настоящий pub/sub сервис через тот же трейт
#[derive(Clone, Default)]
pub struct MemoryRelay {
    channels: Arc<Mutex<ChannelMap>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalRelay for MemoryRelay {
    async fn subscribe(&self, channel: &str) -> Result<RelaySubscription, CallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels
            .lock()
            .unwrap()
            .entry(channel.to_owned())
            .or_default()
            .push((id, tx));

        let channels = self.channels.clone();
        let channel_name = channel.to_owned();
        let unsub = Box::new(move || {
            if let Some(subs) = channels.lock().unwrap().get_mut(&channel_name) {
                subs.retain(|(sub_id, _)| *sub_id != id);
            }
        });
        Ok(RelaySubscription::new(rx, unsub))
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), CallError> {
        let mut map = self.channels.lock().unwrap();
        if let Some(subs) = map.get_mut(channel) {
            // выбрасываем подписчиков с закрытым приёмником
            subs.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        } else {
            // нет подписчиков, best-effort, сообщение теряется
            log(&format!("publish to {channel}: no subscribers, dropped"));
        }
        Ok(())
    }
}
