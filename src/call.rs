use crate::error::{CallError, EndReason};
use crate::events::{CallEvent, CallEventReceiver, CallEventSender};
use crate::identity::Identity;
use crate::logger::log;
use crate::media::{LocalMedia, MediaSource, RemoteMedia};
use crate::peer::events::{PeerEvent, PeerEventKind, PeerEventReceiver, PeerEventSender};
use crate::peer::session::{SessionConnector, SessionEngine};
use crate::peer::types::{IceCandidate, SdpPayload};
use crate::relay::{RelaySubscription, SignalRelay};
use crate::signaling::{self, SignalMessage};
use crate::utils::{analyze_candidates, random_id};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Статус звонка; ровно одно значение в любой момент
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    /// Offer отправлен, ждём answer
    Calling,
    /// Offer получен, ждём локальный accept/reject
    Incoming,
    /// Транспорт сообщил об установленном пути
    Connected,
}

/// Команды от слоя презентации; обрабатываются последовательно в event loop
enum CallCommand {
    Originate(Identity),
    Accept,
    Reject,
    Hangup,
    Snapshot(oneshot::Sender<CallSnapshot>),
    Unbind,
}

/// Диагностический снимок внутреннего состояния (для UI и тестов инвариантов)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub peer: Option<Identity>,
    pub has_session: bool,
    pub has_local_media: bool,
    pub has_remote_media: bool,
    pub has_pending_offer: bool,
}

/// Единственная запись "текущий звонок"; все поля очищаются при возврате в idle
#[derive(Default)]
struct CallSession {
    peer: Option<Identity>,
    call_id: Option<String>,
    local_media: Option<LocalMedia>,
    remote_media: Option<RemoteMedia>,
    pending_remote_offer: Option<SdpPayload>,
    engine: Option<Box<dyn SessionEngine>>,
    /// Отправленные локальные кандидаты текущего звонка
    local_candidates: Vec<IceCandidate>,
}

/// Сигнальный брокер + машина состояний звонка для одного пользователя.
/// bind() подписывает identity-канал на всё время сессии; один звонок
/// за раз, без call-waiting
pub struct CallManager {
    identity: Identity,
    relay: Arc<dyn SignalRelay>,
    media: Arc<dyn MediaSource>,
    connector: Arc<dyn SessionConnector>,
    status: CallStatus,
    session: CallSession,
    events_tx: CallEventSender,
    status_tx: watch::Sender<CallStatus>,
    peer_tx: PeerEventSender,
}

impl CallManager {
    /// Identity Channel Binding: подписка на `user-<identity>` и запуск
    /// event loop. Повторный bind после unbind создаёт независимый экземпляр
    pub async fn bind(
        identity: Identity,
        relay: Arc<dyn SignalRelay>,
        media: Arc<dyn MediaSource>,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<CallHandle, CallError> {
        let subscription = relay.subscribe(&identity.channel()).await?;
        log(&format!("Bound signaling channel {}", identity.channel()));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(CallStatus::Idle);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let manager = CallManager {
            identity,
            relay,
            media,
            connector,
            status: CallStatus::Idle,
            session: CallSession::default(),
            events_tx,
            status_tx,
            peer_tx,
        };
        let task = tokio::spawn(manager.run(cmd_rx, subscription, peer_rx));

        Ok(CallHandle {
            cmd_tx,
            status_rx,
            events_rx,
            task: Some(task),
        })
    }

    /// Все переходы сериализованы здесь: команды UI, сигнальные сообщения
    /// и события транспорта идут через одну очередь выбора
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<CallCommand>,
        mut subscription: RelaySubscription,
        mut peer_rx: PeerEventReceiver,
    ) {
        loop {
            tokio::select! {
                // порядок фиксированный: команды → сигналы → транспорт,
                // чтобы гонки (glare) разрешались детерминированно
                biased;
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    // handle уничтожен, завершаем сессию
                    None => {
                        self.teardown(EndReason::Hangup).await;
                        break;
                    }
                },
                msg = subscription.recv() => match msg {
                    Some(raw) => match signaling::decode(&raw) {
                        Ok(msg) => self.handle_signal(msg).await,
                        // битое сообщение не роняет event loop
                        Err(e) => log(&format!("Malformed signal discarded: {}", e)),
                    },
                    // relay закрыл identity-канал
                    None => {
                        log("Relay subscription closed, unbinding");
                        self.teardown(EndReason::TransportFailed).await;
                        break;
                    }
                },
                Some(event) = peer_rx.recv() => self.handle_peer_event(event).await,
            }
        }
        subscription.unsubscribe();
    }

    /// true, пора выйти из event loop
    async fn handle_command(&mut self, cmd: CallCommand) -> bool {
        match cmd {
            CallCommand::Originate(peer) => self.originate(peer).await,
            CallCommand::Accept => self.accept().await,
            CallCommand::Reject => {
                if self.status == CallStatus::Incoming {
                    self.teardown(EndReason::Rejected).await;
                } else {
                    log("reject() outside incoming, no-op");
                }
            }
            CallCommand::Hangup => {
                if self.status == CallStatus::Idle {
                    // идемпотентно: повторный hangup ничего не делает
                    log("hangup() while idle, no-op");
                } else {
                    self.teardown(EndReason::Hangup).await;
                }
            }
            CallCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            CallCommand::Unbind => {
                if self.status != CallStatus::Idle {
                    self.teardown(EndReason::Hangup).await;
                }
                log("Unbinding signaling channel");
                return true;
            }
        }
        false
    }

    /// Wire-форма канала: JSON → gzip → base64, см. `signaling::encode`
    async fn send_signal(&self, peer: &Identity, msg: SignalMessage) -> Result<(), CallError> {
        let wire = signaling::encode(&msg)?;
        self.relay.publish(&peer.channel(), wire).await
    }

    /// idle → calling: захват микрофона, создание движка, offer в канал пира
    async fn originate(&mut self, peer: Identity) {
        if self.status != CallStatus::Idle {
            // защита от повторного входа по статусу
            log("originate() while call active, no-op");
            return;
        }

        let local = match self.media.acquire().await {
            Ok(local) => local,
            Err(e) => {
                // отказ в доступе: переход прерван, остаёмся в idle
                self.fail_setup(None, None, e).await;
                return;
            }
        };

        let call_id = random_id();
        let mut engine = match self
            .connector
            .connect(call_id.clone(), local.clone(), self.peer_tx.clone())
            .await
        {
            Ok(engine) => engine,
            Err(e) => {
                self.fail_setup(None, Some(local), e).await;
                return;
            }
        };

        let offer = match engine.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail_setup(Some(engine), Some(local), e).await;
                return;
            }
        };

        // фиксируем состояние до publish, чтобы trickle-кандидаты
        // нашли активную сессию
        self.session.peer = Some(peer.clone());
        self.session.call_id = Some(call_id);
        self.session.local_media = Some(local);
        self.session.engine = Some(engine);

        let msg = SignalMessage::Offer {
            payload: offer,
            caller: self.identity.clone(),
        };
        if let Err(e) = self.send_signal(&peer, msg).await {
            let engine = self.session.engine.take();
            let local = self.session.local_media.take();
            self.fail_setup(engine, local, e).await;
            return;
        }

        log(&format!("Offer sent to {}", peer));
        self.set_status(CallStatus::Calling);
    }

    /// incoming → (connected по транспорту): захват микрофона, answer
    /// уходит в канал звонившего сразу
    async fn accept(&mut self) {
        if self.status != CallStatus::Incoming || self.session.engine.is_some() {
            log("accept() outside incoming, no-op");
            return;
        }
        let Some(offer) = self.session.pending_remote_offer.take() else {
            log("accept() with no pending offer, no-op");
            return;
        };
        let Some(peer) = self.session.peer.clone() else {
            log("accept() with no peer identity, no-op");
            return;
        };

        let local = match self.media.acquire().await {
            Ok(local) => local,
            Err(e) => {
                self.fail_setup(None, None, e).await;
                return;
            }
        };

        let call_id = offer.call_id.clone();
        let mut engine = match self
            .connector
            .connect(call_id, local.clone(), self.peer_tx.clone())
            .await
        {
            Ok(engine) => engine,
            Err(e) => {
                self.fail_setup(None, Some(local), e).await;
                return;
            }
        };

        let answer = match engine.create_answer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail_setup(Some(engine), Some(local), e).await;
                return;
            }
        };

        self.session.local_media = Some(local);
        self.session.engine = Some(engine);

        let msg = SignalMessage::Answer { payload: answer };
        if let Err(e) = self.send_signal(&peer, msg).await {
            let engine = self.session.engine.take();
            let local = self.session.local_media.take();
            self.fail_setup(engine, local, e).await;
            return;
        }

        // статус остаётся incoming до колбэка connected от транспорта
        log(&format!("Answer sent to {}", peer));
    }

    async fn handle_signal(&mut self, msg: SignalMessage) {
        match msg {
            SignalMessage::Offer { payload, caller } => {
                if self.status != CallStatus::Idle {
                    // нет call-waiting: второй offer молча игнорируется
                    log(&format!("Offer from {} ignored: call already active", caller));
                    return;
                }
                log(&format!("Incoming call from {}", caller));
                self.session.peer = Some(caller.clone());
                self.session.call_id = Some(payload.call_id.clone());
                self.session.pending_remote_offer = Some(payload);
                self.emit(CallEvent::IncomingCall { from: caller });
                self.set_status(CallStatus::Incoming);
            }
            SignalMessage::Answer { payload } => {
                let awaiting = self.status == CallStatus::Calling
                    && self.session.call_id.as_deref() == Some(payload.call_id.as_str());
                match self.session.engine.as_mut() {
                    Some(engine) if awaiting => {
                        if let Err(e) = engine.set_remote_answer(payload).await {
                            log(&format!("Failed to apply answer: {}", e));
                            self.emit(CallEvent::CallFailed {
                                error: e.to_string(),
                            });
                            self.teardown(EndReason::TransportFailed).await;
                        }
                        // connected объявит транспортный колбэк, не сам answer
                    }
                    _ => log("Stale answer discarded"),
                }
            }
            SignalMessage::Candidate { candidate } => {
                let matches_call =
                    self.session.call_id.as_deref() == Some(candidate.call_id.as_str());
                match self.session.engine.as_mut() {
                    Some(engine) if matches_call => {
                        // кандидаты легитимно приходят раньше answer -
                        // движок ставит их в очередь, не отбрасывает
                        if let Err(e) = engine.add_remote_candidate(candidate).await {
                            log(&format!("Failed to add ICE candidate: {}", e));
                        }
                    }
                    _ => {
                        // сессии нет (или чужой call id), кандидат теряется
                        log("Stale ICE candidate discarded");
                    }
                }
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.session.call_id.as_deref() != Some(event.call_id.as_str()) {
            if let PeerEventKind::RemoteTrackReceived(remote) = event.kind {
                remote.release();
            }
            log("Stale peer event discarded");
            return;
        }

        match event.kind {
            PeerEventKind::CandidateDiscovered(candidate) => {
                self.session.local_candidates.push(candidate.clone());
                if let Some(peer) = self.session.peer.clone() {
                    // fire-and-forget: неудача отправки кандидата не роняет звонок
                    let msg = SignalMessage::Candidate { candidate };
                    if let Err(e) = self.send_signal(&peer, msg).await {
                        log(&format!("Failed to publish ICE candidate: {}", e));
                    }
                }
            }
            PeerEventKind::GatheringComplete => {
                analyze_candidates(&self.session.local_candidates);
            }
            PeerEventKind::ConnectionStateChanged(state) => {
                self.handle_transport_state(state).await;
            }
            PeerEventKind::RemoteTrackReceived(remote) => {
                if self.status == CallStatus::Idle {
                    remote.release();
                    return;
                }
                self.session.remote_media = Some(remote.clone());
                self.emit(CallEvent::RemoteMediaReady(remote));
            }
        }
    }

    /// Единственный авторитет для connected и для пути отказа в idle
    async fn handle_transport_state(&mut self, state: RTCPeerConnectionState) {
        match state {
            RTCPeerConnectionState::Connected => {
                let negotiating = self.session.engine.is_some()
                    && matches!(self.status, CallStatus::Calling | CallStatus::Incoming);
                if negotiating {
                    log("Transport connected");
                    self.set_status(CallStatus::Connected);
                }
            }
            RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Disconnected
            | RTCPeerConnectionState::Closed => {
                if self.status != CallStatus::Idle {
                    log(&format!("Transport reported {:?}, ending call", state));
                    self.teardown(EndReason::TransportFailed).await;
                }
            }
            other => {
                log(&format!("Transport state {:?}, ignoring", other));
            }
        }
    }

    /// Универсальный путь восстановления: освободить всё, вернуться в idle.
    /// "Goodbye" в канал не отправляется, удалённая сторона узнаёт
    /// о завершении по состоянию транспорта
    async fn teardown(&mut self, reason: EndReason) {
        if let Some(mut engine) = self.session.engine.take() {
            engine.close().await;
        }
        if let Some(local) = self.session.local_media.take() {
            local.release();
        }
        if let Some(remote) = self.session.remote_media.take() {
            remote.release();
        }
        self.session.pending_remote_offer = None;
        self.session.peer = None;
        self.session.call_id = None;
        self.session.local_candidates.clear();

        self.set_status(CallStatus::Idle);
        self.emit(CallEvent::CallEnded { reason });
    }

    /// Прерывание незавершённого перехода: ресурсы начатой попытки
    /// освобождаются, статус возвращается в idle, UI получает ошибку
    async fn fail_setup(
        &mut self,
        engine: Option<Box<dyn SessionEngine>>,
        local: Option<LocalMedia>,
        error: CallError,
    ) {
        if let Some(mut engine) = engine {
            engine.close().await;
        }
        if let Some(local) = local {
            local.release();
        }
        self.session.pending_remote_offer = None;
        self.session.peer = None;
        self.session.call_id = None;
        self.session.local_candidates.clear();

        self.set_status(CallStatus::Idle);
        log(&format!("Call setup failed: {}", error));
        self.emit(CallEvent::CallFailed {
            error: error.to_string(),
        });
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            status: self.status,
            peer: self.session.peer.clone(),
            has_session: self.session.engine.is_some(),
            has_local_media: self.session.local_media.is_some(),
            has_remote_media: self.session.remote_media.is_some(),
            has_pending_offer: self.session.pending_remote_offer.is_some(),
        }
    }

    fn set_status(&mut self, status: CallStatus) {
        if self.status != status {
            log(&format!("Status {:?} -> {:?}", self.status, status));
            self.status = status;
            self.status_tx.send_replace(status);
            self.emit(CallEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: CallEvent) {
        // приёмник мог быть уничтожен UI, это не ошибка ядра
        let _ = self.events_tx.send(event);
    }
}

/// Handle для слоя презентации: четыре операции, статус и события.
/// Уничтожение handle завершает звонок и отписывает identity-канал
pub struct CallHandle {
    cmd_tx: mpsc::UnboundedSender<CallCommand>,
    status_rx: watch::Receiver<CallStatus>,
    events_rx: CallEventReceiver,
    task: Option<JoinHandle<()>>,
}

impl CallHandle {
    pub fn originate(&self, peer: Identity) -> Result<(), CallError> {
        self.send(CallCommand::Originate(peer))
    }

    pub fn accept(&self) -> Result<(), CallError> {
        self.send(CallCommand::Accept)
    }

    pub fn reject(&self) -> Result<(), CallError> {
        self.send(CallCommand::Reject)
    }

    pub fn hangup(&self) -> Result<(), CallError> {
        self.send(CallCommand::Hangup)
    }

    pub fn status(&self) -> CallStatus {
        *self.status_rx.borrow()
    }

    /// Отдельный watch для ожидания смены статуса
    pub fn status_watch(&self) -> watch::Receiver<CallStatus> {
        self.status_rx.clone()
    }

    pub async fn next_event(&mut self) -> Option<CallEvent> {
        self.events_rx.recv().await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(CallCommand::Snapshot(tx))?;
        rx.await.map_err(|_| CallError::NotBound)
    }

    /// Отписка идемпотентна: после завершения event loop повторный
    /// вызов просто ничего не делает
    pub async fn unbind(mut self) {
        let _ = self.cmd_tx.send(CallCommand::Unbind);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, cmd: CallCommand) -> Result<(), CallError> {
        self.cmd_tx.send(cmd).map_err(|_| CallError::NotBound)
    }
}
