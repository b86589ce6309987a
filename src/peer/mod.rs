pub mod connection;
pub mod events;
pub mod session;
pub mod types;

pub use events::{PeerEvent, PeerEventKind, PeerEventReceiver, PeerEventSender};
pub use session::{SessionConnector, SessionEngine, WebRtcConnector, WebRtcSession};
pub use types::{IceCandidate, SdpPayload, ServerConfig};
