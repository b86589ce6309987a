use crate::call::CallStatus;
use crate::error::EndReason;
use crate::identity::Identity;
use crate::media::RemoteMedia;
use tokio::sync::mpsc;

/// События для слоя презентации (экраны звонка вне этого ядра)
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Пришёл session-offer в состоянии idle
    IncomingCall { from: Identity },
    /// Любая смена статуса машины состояний
    StatusChanged(CallStatus),
    /// Транспорт доставил удалённый аудиопоток (для маршрутизации звука)
    RemoteMediaReady(RemoteMedia),
    /// Звонок завершён, все ресурсы освобождены
    CallEnded { reason: EndReason },
    /// Ошибка прервала начатый переход (например, отказ в доступе к микрофону)
    CallFailed { error: String },
}

pub type CallEventSender = mpsc::UnboundedSender<CallEvent>;
pub type CallEventReceiver = mpsc::UnboundedReceiver<CallEvent>;
