use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;

/// JSON control envelope sent as a text message, keyed on `type`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ControlEnvelope {
    /// Device switched firmware mode; `calibracion: true` restarts calibration.
    #[serde(rename = "modo")]
    Mode { calibracion: bool },
}

impl ControlEnvelope {
    pub fn restarts_calibration(&self) -> bool {
        matches!(self, ControlEnvelope::Mode { calibracion: true })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Control(ControlEnvelope),
    Frame(Vec<u8>),
}

/// Splits on transport framing first, then on the envelope discriminant.
/// Anything unrecognised (unknown envelope types, pings) yields `None`.
pub fn classify(message: Message) -> Option<RelayMessage> {
    match message {
        Message::Binary(bytes) => Some(RelayMessage::Frame(bytes.to_vec())),
        Message::Text(text) => serde_json::from_str::<ControlEnvelope>(text.as_str())
            .ok()
            .map(RelayMessage::Control),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_envelope_is_control() {
        let msg = Message::text(r#"{"type":"modo","calibracion":true}"#);
        let parsed = classify(msg);
        assert_eq!(
            parsed,
            Some(RelayMessage::Control(ControlEnvelope::Mode { calibracion: true }))
        );
        if let Some(RelayMessage::Control(envelope)) = parsed {
            assert!(envelope.restarts_calibration());
        }
    }

    #[test]
    fn normal_mode_envelope_does_not_restart() {
        let envelope: ControlEnvelope =
            serde_json::from_str(r#"{"type":"modo","calibracion":false}"#).unwrap();
        assert!(!envelope.restarts_calibration());
    }

    #[test]
    fn binary_is_frame() {
        let msg = Message::binary(vec![0xff, 0xd8, 0xff]);
        assert_eq!(classify(msg), Some(RelayMessage::Frame(vec![0xff, 0xd8, 0xff])));
    }

    #[test]
    fn unknown_text_is_ignored() {
        assert_eq!(classify(Message::text(r#"{"type":"alerta"}"#)), None);
        assert_eq!(classify(Message::text("not json")), None);
    }
}
