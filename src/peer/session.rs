use crate::error::CallError;
use crate::logger::log;
use crate::media::LocalMedia;
use crate::peer::connection::{new_peer, validate_servers};
use crate::peer::events::PeerEventSender;
use crate::peer::types::{IceCandidate, SdpPayload, ServerConfig};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

/// Переговорный движок одного звонка: генерирует локальные описания,
/// принимает удалённые описания и кандидатов, закрывается безопасно
/// в любой фазе переговоров
#[async_trait]
pub trait SessionEngine: Send + Sync {
    /// Локальный offer; кандидаты начинают приходить через PeerEvent
    async fn create_offer(&mut self) -> Result<SdpPayload, CallError>;

    /// Потребляем удалённый offer и отвечаем на него
    async fn create_answer(&mut self, remote: SdpPayload) -> Result<SdpPayload, CallError>;

    async fn set_remote_answer(&mut self, answer: SdpPayload) -> Result<(), CallError>;

    /// Кандидаты могут приходить в любом порядке относительно answer
    /// и не отвергаются за "ранний" приход
    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError>;

    async fn close(&mut self);
}

/// Фабрика движков: один connect() на каждую попытку звонка
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        call_id: String,
        local: LocalMedia,
        events: PeerEventSender,
    ) -> Result<Box<dyn SessionEngine>, CallError>;
}

/// Продакшен-движок поверх webrtc crate
pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    call_id: String,
    /// Кандидаты, полученные до установки remote description
    pending_remote: Vec<IceCandidate>,
}

impl WebRtcSession {
    fn payload(&self, sdp: webrtc::peer_connection::sdp::session_description::RTCSessionDescription) -> SdpPayload {
        SdpPayload {
            sdp,
            call_id: self.call_id.clone(),
            ts: chrono::Utc::now().timestamp(),
        }
    }

    /// Применяет все отложенные кандидаты после установки remote description
    async fn apply_pending_candidates(&mut self) {
        let candidates = std::mem::take(&mut self.pending_remote);
        for candidate in candidates {
            log(&format!("Applying pending candidate: {:?}", candidate));
            if let Err(e) = self.pc.add_ice_candidate(to_init(candidate)).await {
                log(&format!("Failed to apply pending candidate: {:?}", e));
            }
        }
    }

    async fn local_description(&self) -> Result<SdpPayload, CallError> {
        let sdp = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| CallError::Transport("no local description after negotiation".into()))?;
        Ok(self.payload(sdp))
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

#[async_trait]
impl SessionEngine for WebRtcSession {
    async fn create_offer(&mut self) -> Result<SdpPayload, CallError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        // НЕ ждём gathering complete: кандидаты уходят trickle-потоком
        self.local_description().await
    }

    async fn create_answer(&mut self, remote: SdpPayload) -> Result<SdpPayload, CallError> {
        self.pc.set_remote_description(remote.sdp).await?;
        self.apply_pending_candidates().await;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn set_remote_answer(&mut self, answer: SdpPayload) -> Result<(), CallError> {
        self.pc.set_remote_description(answer.sdp).await?;
        self.apply_pending_candidates().await;
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        // Если remote description уже установлен, применяем кандидат сразу
        if self.pc.remote_description().await.is_some() {
            self.pc.add_ice_candidate(to_init(candidate)).await?;
            log("Successfully added ICE candidate");
        } else {
            // Иначе откладываем до установки remote description
            log("Remote description not set yet, queuing candidate");
            self.pending_remote.push(candidate);
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.pc.close().await {
            log(&format!("Peer connection close failed: {:?}", e));
        }
    }
}

/// Фабрика продакшен-движков с пользовательской ICE конфигурацией
pub struct WebRtcConnector {
    servers: Vec<ServerConfig>,
}

impl WebRtcConnector {
    /// Пустой список означает дефолтные STUN серверы
    pub fn new(servers: Vec<ServerConfig>) -> Result<Self, CallError> {
        validate_servers(&servers)?;
        Ok(WebRtcConnector { servers })
    }
}

#[async_trait]
impl SessionConnector for WebRtcConnector {
    async fn connect(
        &self,
        call_id: String,
        local: LocalMedia,
        events: PeerEventSender,
    ) -> Result<Box<dyn SessionEngine>, CallError> {
        let pc = new_peer(&self.servers, &call_id, events).await?;

        if let Some(track) = local.track() {
            pc.add_track(track).await?;
        }

        Ok(Box::new(WebRtcSession {
            pc,
            call_id,
            pending_remote: Vec::new(),
        }))
    }
}
