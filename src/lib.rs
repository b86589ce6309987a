//! voxlink, сигнальный брокер и машина состояний P2P аудио-звонка.
//!
//! Два участника находят друг друга через внешний pub/sub relay
//! (канал `user-<identity>` у каждого) и обмениваются offer/answer/ICE
//! до установления прямого аудио-канала. Отдельного signaling-сервера нет.

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod logger;
pub mod media;
pub mod peer;
pub mod relay;
pub mod signaling;
pub mod utils;

pub use call::{CallHandle, CallManager, CallSnapshot, CallStatus};
pub use error::{CallError, EndReason};
pub use events::{CallEvent, CallEventReceiver};
pub use identity::Identity;
pub use media::{LocalMedia, MediaSource, MicrophoneSource, RemoteMedia};
pub use peer::{
    IceCandidate, SdpPayload, ServerConfig, SessionConnector, SessionEngine, WebRtcConnector,
};
pub use relay::{MemoryRelay, RelaySubscription, SignalRelay};
pub use signaling::SignalMessage;
