use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use voxlink::error::CallError;
use voxlink::media::{LocalMedia, MediaSource, RemoteMedia};
use voxlink::peer::events::{PeerEvent, PeerEventKind, PeerEventSender};
use voxlink::peer::{IceCandidate, SdpPayload, SessionConnector, SessionEngine};
use voxlink::relay::SignalRelay;
use voxlink::{signaling, CallHandle, CallManager, CallStatus, Identity, MemoryRelay, SignalMessage};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub const MINIMAL_SDP: &str =
    "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\n";

pub fn offer_sdp() -> RTCSessionDescription {
    RTCSessionDescription::offer(MINIMAL_SDP.to_owned()).expect("minimal offer sdp")
}

pub fn answer_sdp() -> RTCSessionDescription {
    RTCSessionDescription::answer(MINIMAL_SDP.to_owned()).expect("minimal answer sdp")
}

/// Publishes a typed message in its wire form, the way a bound manager would.
pub async fn publish_signal(relay: &MemoryRelay, channel: &str, msg: SignalMessage) {
    let wire = signaling::encode(&msg).expect("encode failed");
    relay.publish(channel, wire).await.expect("publish failed");
}

pub fn host_candidate(call_id: &str) -> IceCandidate {
    IceCandidate {
        candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        call_id: call_id.to_owned(),
    }
}

/// Media source double counting acquire/release pairs.
pub struct MockMedia {
    pub acquired: AtomicUsize,
    pub released: Arc<AtomicUsize>,
    deny: AtomicBool,
}

impl MockMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(MockMedia {
            acquired: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
            deny: AtomicBool::new(false),
        })
    }

    pub fn denying() -> Arc<Self> {
        let media = Self::new();
        media.deny.store(true, Ordering::SeqCst);
        media
    }

    pub fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire(&self) -> Result<LocalMedia, CallError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(CallError::PermissionDenied);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let released = self.released.clone();
        Ok(LocalMedia::detached(move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[derive(Default)]
pub struct ProbeState {
    pub offers_created: usize,
    pub answers_created: usize,
    pub remote_offer: Option<SdpPayload>,
    pub remote_answer: Option<SdpPayload>,
    pub remote_candidates: Vec<IceCandidate>,
    pub closed: usize,
}

/// Shared view into one mock negotiation engine; lets tests observe what
/// the state machine fed it and inject transport callbacks.
#[derive(Clone)]
pub struct SessionProbe {
    pub call_id: String,
    pub state: Arc<Mutex<ProbeState>>,
    events: PeerEventSender,
}

impl SessionProbe {
    fn send(&self, kind: PeerEventKind) {
        let _ = self.events.send(PeerEvent {
            call_id: self.call_id.clone(),
            kind,
        });
    }

    pub fn fire_connected(&self) {
        self.send(PeerEventKind::ConnectionStateChanged(
            RTCPeerConnectionState::Connected,
        ));
    }

    pub fn fire_failed(&self) {
        self.send(PeerEventKind::ConnectionStateChanged(
            RTCPeerConnectionState::Failed,
        ));
    }

    pub fn fire_remote_track(&self) -> RemoteMedia {
        let media = RemoteMedia::detached();
        self.send(PeerEventKind::RemoteTrackReceived(media.clone()));
        media
    }

    pub fn fire_local_candidate(&self) {
        self.send(PeerEventKind::CandidateDiscovered(host_candidate(
            &self.call_id,
        )));
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().remote_candidates.clone()
    }

    pub fn has_remote_answer(&self) -> bool {
        self.state.lock().unwrap().remote_answer.is_some()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closed
    }
}

struct MockSession {
    call_id: String,
    state: Arc<Mutex<ProbeState>>,
}

#[async_trait]
impl SessionEngine for MockSession {
    async fn create_offer(&mut self) -> Result<SdpPayload, CallError> {
        self.state.lock().unwrap().offers_created += 1;
        Ok(SdpPayload {
            sdp: offer_sdp(),
            call_id: self.call_id.clone(),
            ts: 0,
        })
    }

    async fn create_answer(&mut self, remote: SdpPayload) -> Result<SdpPayload, CallError> {
        let mut state = self.state.lock().unwrap();
        state.answers_created += 1;
        state.remote_offer = Some(remote);
        Ok(SdpPayload {
            sdp: answer_sdp(),
            call_id: self.call_id.clone(),
            ts: 0,
        })
    }

    async fn set_remote_answer(&mut self, answer: SdpPayload) -> Result<(), CallError> {
        self.state.lock().unwrap().remote_answer = Some(answer);
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        // early candidates are recorded, never rejected
        self.state.lock().unwrap().remote_candidates.push(candidate);
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().closed += 1;
    }
}

/// Connector double: hands out mock engines and keeps a probe per call.
pub struct MockConnector {
    pub probes: Mutex<Vec<SessionProbe>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(MockConnector {
            probes: Mutex::new(Vec::new()),
        })
    }

    pub fn probe_count(&self) -> usize {
        self.probes.lock().unwrap().len()
    }

    pub fn last_probe(&self) -> SessionProbe {
        self.probes
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session was created")
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(
        &self,
        call_id: String,
        _local: LocalMedia,
        events: PeerEventSender,
    ) -> Result<Box<dyn SessionEngine>, CallError> {
        let state = Arc::new(Mutex::new(ProbeState::default()));
        self.probes.lock().unwrap().push(SessionProbe {
            call_id: call_id.clone(),
            state: state.clone(),
            events,
        });
        Ok(Box::new(MockSession { call_id, state }))
    }
}

/// One simulated user: bound manager plus its doubles.
pub struct TestPeer {
    pub handle: CallHandle,
    pub media: Arc<MockMedia>,
    pub connector: Arc<MockConnector>,
}

pub async fn bind_peer(relay: &MemoryRelay, name: &str) -> TestPeer {
    let media = MockMedia::new();
    let connector = MockConnector::new();
    let handle = CallManager::bind(
        Identity::new(name),
        Arc::new(relay.clone()),
        media.clone(),
        connector.clone(),
    )
    .await
    .expect("bind failed");
    TestPeer {
        handle,
        media,
        connector,
    }
}

pub async fn wait_status(rx: &mut watch::Receiver<CallStatus>, want: CallStatus) {
    timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timeout waiting for status {:?}", want))
        .expect("status watch closed");
}

/// Polls an arbitrary condition; used where no status change is expected.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timeout waiting for condition");
}
