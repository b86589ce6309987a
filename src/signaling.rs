use crate::error::CallError;
use crate::identity::Identity;
use crate::peer::types::{IceCandidate, SdpPayload};
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Три вида сигнальных сообщений; тег `kind` нужен только для диспетчеризации
/// на принимающей стороне, содержимое transport-слоя не интерпретируется
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind")]
pub enum SignalMessage {
    #[serde(rename = "session-offer")]
    Offer { payload: SdpPayload, caller: Identity },
    #[serde(rename = "session-answer")]
    Answer { payload: SdpPayload },
    #[serde(rename = "ice-candidate")]
    Candidate { candidate: IceCandidate },
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "session-offer",
            SignalMessage::Answer { .. } => "session-answer",
            SignalMessage::Candidate { .. } => "ice-candidate",
        }
    }
}

/// Кодируем сообщение: JSON → gzip → base64
pub fn encode(msg: &SignalMessage) -> Result<String, CallError> {
    let json = serde_json::to_vec(msg)?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)?;
    let compressed = gz.finish()?;
    Ok(general_purpose::STANDARD.encode(compressed))
}

/// Обратный путь: base64 → gunzip → JSON
pub fn decode(encoded: &str) -> Result<SignalMessage, CallError> {
    let compressed = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| CallError::Codec(e.to_string()))?;
    let mut gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    gz.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
