use crate::media::RemoteMedia;
use crate::peer::types::IceCandidate;
use tokio::sync::mpsc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// События переговорного движка, вместо прямых колбэков:
/// state machine потребляет их из одной очереди
#[derive(Debug, Clone)]
pub struct PeerEvent {
    /// ID звонка, породившего событие; устаревшие отбрасываются по нему
    pub call_id: String,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// Найден локальный ICE кандидат, отправляется пиру сразу (fire-and-forget)
    CandidateDiscovered(IceCandidate),
    /// Сбор кандидатов завершён (null candidate от движка)
    GatheringComplete,
    /// Транспорт сменил состояние; единственный авторитет для `connected`
    ConnectionStateChanged(RTCPeerConnectionState),
    /// Транспорт доставил удалённый аудиопоток
    RemoteTrackReceived(RemoteMedia),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;
pub type PeerEventReceiver = mpsc::UnboundedReceiver<PeerEvent>;
