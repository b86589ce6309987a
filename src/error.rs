use thiserror::Error;

/// Ошибки звонка; любая из них терминальна только для текущего звонка
#[derive(Debug, Error)]
pub enum CallError {
    /// Пользователь не дал доступ к микрофону
    #[error("microphone permission denied")]
    PermissionDenied,

    /// Сбой транспортного/переговорного слоя
    #[error("transport failure: {0}")]
    Transport(String),

    /// Сбой обмена через relay
    #[error("relay failure: {0}")]
    Relay(String),

    /// Невалидный сигнальный payload
    #[error("malformed signaling payload: {0}")]
    Codec(String),

    /// Менеджер звонков не запущен (handle пережил свой event loop)
    #[error("call manager is not running")]
    NotBound,
}

impl From<webrtc::Error> for CallError {
    fn from(e: webrtc::Error) -> Self {
        CallError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for CallError {
    fn from(e: serde_json::Error) -> Self {
        CallError::Codec(e.to_string())
    }
}

impl From<std::io::Error> for CallError {
    fn from(e: std::io::Error) -> Self {
        CallError::Codec(e.to_string())
    }
}

/// Причина завершения звонка, сообщается UI через CallEvent::CallEnded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Локальный hangup
    Hangup,
    /// Локальный reject входящего звонка
    Rejected,
    /// Транспорт сообщил failed/disconnected
    TransportFailed,
}
