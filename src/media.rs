use crate::error::CallError;
use crate::logger::log;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Источник локального аудио; ровно одно acquire() на звонок
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Запрашивает доступ к микрофону; при отказе, PermissionDenied
    /// без частичного захвата ресурсов
    async fn acquire(&self) -> Result<LocalMedia, CallError>;
}

type ReleaseHook = Box<dyn Fn() + Send + Sync>;

struct LocalMediaInner {
    track: Option<Arc<TrackLocalStaticSample>>,
    released: AtomicBool,
    on_release: Option<ReleaseHook>,
}

/// Handle локального аудио-захвата; живёт ровно один звонок
#[derive(Clone)]
pub struct LocalMedia {
    inner: Arc<LocalMediaInner>,
}

impl LocalMedia {
    pub fn from_track(track: Arc<TrackLocalStaticSample>) -> Self {
        LocalMedia {
            inner: Arc::new(LocalMediaInner {
                track: Some(track),
                released: AtomicBool::new(false),
                on_release: None,
            }),
        }
    }

    /// Handle без WebRTC-трека: платформенные интеграции и тестовые двойники
    pub fn detached(on_release: impl Fn() + Send + Sync + 'static) -> Self {
        LocalMedia {
            inner: Arc::new(LocalMediaInner {
                track: None,
                released: AtomicBool::new(false),
                on_release: Some(Box::new(on_release)),
            }),
        }
    }

    pub(crate) fn track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.inner.track.clone()
    }

    /// Идемпотентно: повторный release, no-op.
    /// Платформенный capture-поток останавливается через on_release hook
    pub fn release(&self) {
        if !self.inner.released.swap(true, Ordering::SeqCst) {
            log("LocalMedia released");
            if let Some(hook) = &self.inner.on_release {
                hook();
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("has_track", &self.inner.track.is_some())
            .field("released", &self.is_released())
            .finish()
    }
}

struct RemoteMediaInner {
    track: Option<Arc<TrackRemote>>,
    released: AtomicBool,
}

/// Handle удалённого аудио, доставленного транспортом;
/// освобождается тем же путём, что и локальный, при завершении звонка
#[derive(Clone)]
pub struct RemoteMedia {
    inner: Arc<RemoteMediaInner>,
}

impl RemoteMedia {
    pub fn from_track(track: Arc<TrackRemote>) -> Self {
        RemoteMedia {
            inner: Arc::new(RemoteMediaInner {
                track: Some(track),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Двойник без трека для тестов
    pub fn detached() -> Self {
        RemoteMedia {
            inner: Arc::new(RemoteMediaInner {
                track: None,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn track(&self) -> Option<Arc<TrackRemote>> {
        self.inner.track.clone()
    }

    pub fn release(&self) {
        if !self.inner.released.swap(true, Ordering::SeqCst) {
            log("RemoteMedia released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("has_track", &self.inner.track.is_some())
            .field("released", &self.is_released())
            .finish()
    }
}

type PermissionCheck = Box<dyn Fn() -> bool + Send + Sync>;

/// Микрофон как источник Opus-трека. Сами сэмплы пишет платформенный
/// capture-слой; здесь только lifecycle и проверка разрешения
pub struct MicrophoneSource {
    permission: Option<PermissionCheck>,
}

impl MicrophoneSource {
    pub fn new() -> Self {
        MicrophoneSource { permission: None }
    }

    /// Платформа передаёт сюда свой permission-prompt
    pub fn with_permission(check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        MicrophoneSource {
            permission: Some(Box::new(check)),
        }
    }
}

impl Default for MicrophoneSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for MicrophoneSource {
    async fn acquire(&self) -> Result<LocalMedia, CallError> {
        if let Some(check) = &self.permission {
            if !check() {
                log("Microphone permission denied");
                return Err(CallError::PermissionDenied);
            }
        }

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "voxlink-mic".to_owned(),
        ));
        log("Acquired local audio capture track");
        Ok(LocalMedia::from_track(track))
    }
}
