use crate::config::DEFAULT_ICE_SERVERS;
use crate::error::CallError;
use crate::logger::{dump_candidate, dump_selected_pair, log};
use crate::media::RemoteMedia;
use crate::peer::events::{PeerEvent, PeerEventKind, PeerEventSender};
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;

/// Создаём Peer Connection для одного звонка: аудио-кодеки, ICE конфиг,
/// все колбэки переведены в PeerEvent-очередь
pub(crate) async fn new_peer(
    servers: &[ServerConfig],
    call_id: &str,
    events: PeerEventSender,
) -> Result<Arc<RTCPeerConnection>, CallError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| CallError::Transport(e.to_string()))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(rtc_config(servers)).await?);

    // Обработчик локальных кандидатов (Trickle-ICE)
    let candidate_events = events.clone();
    let candidate_call_id = call_id.to_owned();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        if let Some(c) = cand {
            if let Ok(init) = c.to_json() {
                dump_candidate("LOCAL", &init);
                let _ = candidate_events.send(PeerEvent {
                    call_id: candidate_call_id.clone(),
                    kind: PeerEventKind::CandidateDiscovered(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        call_id: candidate_call_id.clone(),
                    }),
                });
            }
        } else {
            // cand == None означает конец сбора
            log("ICE candidate gathering completed (null candidate received)");
            let _ = candidate_events.send(PeerEvent {
                call_id: candidate_call_id.clone(),
                kind: PeerEventKind::GatheringComplete,
            });
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        log(&format!("ICE gathering state changed to: {:?}", state));
        Box::pin(async {})
    }));

    // делаем копию для обработчика состояний
    let pc_state = pc.clone();
    let state_events = events.clone();
    let state_call_id = call_id.to_owned();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        log(&format!("Peer connection state changed to: {:?}", st));

        if matches!(
            st,
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
        ) {
            let pc_stats = pc_state.clone();
            tokio::spawn(async move {
                dump_selected_pair(&pc_stats, "BEFORE-FAIL").await;
            });
        }

        let _ = state_events.send(PeerEvent {
            call_id: state_call_id.clone(),
            kind: PeerEventKind::ConnectionStateChanged(st),
        });
        Box::pin(async {})
    }));

    // Удалённый аудиопоток
    let track_events = events;
    let track_call_id = call_id.to_owned();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        log(&format!(
            "Remote track received: kind={:?} ssrc={}",
            track.kind(),
            track.ssrc()
        ));
        let _ = track_events.send(PeerEvent {
            call_id: track_call_id.clone(),
            kind: PeerEventKind::RemoteTrackReceived(RemoteMedia::from_track(track)),
        });
        Box::pin(async {})
    }));

    Ok(pc)
}

/// Создает конфигурацию для peer connection
fn rtc_config(custom_servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = if custom_servers.is_empty() {
        as_ice_servers(&DEFAULT_ICE_SERVERS)
    } else {
        as_ice_servers(custom_servers)
    };

    RTCConfiguration {
        ice_servers,
        // Более агрессивные настройки ICE
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Перевод пользовательской конфигурации в формат webrtc
pub fn as_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| {
            let url = add_ice_url_scheme(config);
            RTCIceServer {
                urls: vec![url],
                username: config.username.clone().unwrap_or_default(),
                credential: config.credential.clone().unwrap_or_default(),
            }
        })
        .collect()
}

/// Валидация пользовательских серверов: URL не пустой,
/// TURN требует username и credential
pub fn validate_servers(servers: &[ServerConfig]) -> Result<(), CallError> {
    for server in servers {
        if server.url.is_empty() {
            return Err(CallError::Transport(
                "ICE server URL cannot be empty".into(),
            ));
        }
        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(CallError::Transport(
                "TURN servers require username and credential".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn_server(username: Option<&str>, credential: Option<&str>) -> ServerConfig {
        ServerConfig {
            id: "t".into(),
            r#type: "turn".into(),
            url: "turn.example.org:3478".into(),
            username: username.map(str::to_owned),
            credential: credential.map(str::to_owned),
        }
    }

    #[test]
    fn turn_requires_credentials() {
        assert!(validate_servers(&[turn_server(None, None)]).is_err());
        assert!(validate_servers(&[turn_server(Some("u"), None)]).is_err());
        assert!(validate_servers(&[turn_server(Some("u"), Some("c"))]).is_ok());
    }

    #[test]
    fn empty_url_rejected() {
        let mut server = turn_server(Some("u"), Some("c"));
        server.url = String::new();
        assert!(validate_servers(&[server]).is_err());
    }
}
