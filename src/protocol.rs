//! Wire protocol: JSON text frames tagged with `"t"`
//!
//! `ClientMessage` is what the socket hands us, unvalidated. `validate`
//! turns it into an `InboundEvent` the core can trust, or a
//! `MalformedEvent` that never gets past the gateway.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::types::{ChannelId, ConnectionId, Payload, Signal};

pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        #[serde(default)]
        frequency: String,
        #[serde(default, alias = "userId")]
        user_id: String,
    },
    /// A finished recording. Carries either a reference (`signal`) or
    /// base64 bytes (`data`).
    #[serde(alias = "audio_signal", alias = "audioSignal")]
    Signal {
        #[serde(default)]
        frequency: String,
        /// Informational; recipients see the id the sender joined with
        #[serde(default, alias = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    TalkStart,
    TalkStop,
    /// Leave the frequency and end the session
    Leave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        protocol: String,
        connection_id: ConnectionId,
        server_now: String,
    },
    Joined {
        frequency: String,
        members: usize,
    },
    Signal {
        frequency: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    Error {
        code: String,
        msg: String,
    },
}

impl ServerMessage {
    pub fn welcome(connection_id: ConnectionId) -> Self {
        ServerMessage::Welcome {
            protocol: PROTOCOL_VERSION.to_string(),
            connection_id,
            server_now: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(err: &RelayError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            msg: err.to_string(),
        }
    }
}

impl From<&Signal> for ServerMessage {
    fn from(signal: &Signal) -> Self {
        let (reference, data) = match &signal.payload {
            Payload::Reference(r) => (Some(r.clone()), None),
            Payload::Inline(bytes) => (None, Some(STANDARD.encode(bytes))),
        };
        ServerMessage::Signal {
            frequency: signal.channel.as_str().to_string(),
            user_id: signal.user_id.clone(),
            signal: reference,
            data,
        }
    }
}

/// A validated inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Join { channel: ChannelId, user_id: String },
    Signal { channel: ChannelId, payload: Payload },
    TalkStart,
    TalkStop,
    Leave,
}

impl ClientMessage {
    pub fn validate(self, config: &RelayConfig) -> Result<InboundEvent> {
        match self {
            ClientMessage::Join { frequency, user_id } => {
                let channel = parse_channel(&frequency, config)?;
                let user_id = user_id.trim();
                if user_id.is_empty() {
                    return Err(malformed("user_id must not be empty"));
                }
                if user_id.chars().count() > config.max_user_id_len {
                    return Err(malformed(format!(
                        "user_id longer than {} characters",
                        config.max_user_id_len
                    )));
                }
                Ok(InboundEvent::Join {
                    channel,
                    user_id: user_id.to_string(),
                })
            }
            ClientMessage::Signal {
                frequency,
                signal,
                data,
                ..
            } => {
                let channel = parse_channel(&frequency, config)?;
                let payload = match (signal, data) {
                    (Some(reference), None) => Payload::Reference(reference),
                    (None, Some(encoded)) => {
                        if decoded_len(&encoded) > config.max_payload_bytes {
                            return Err(payload_too_large(config));
                        }
                        Payload::Inline(STANDARD.decode(encoded.as_bytes()).map_err(|e| {
                            malformed(format!("data is not valid base64: {}", e))
                        })?)
                    }
                    (Some(_), Some(_)) => {
                        return Err(malformed("send either signal or data, not both"))
                    }
                    (None, None) => return Err(malformed("signal payload is missing")),
                };
                if payload.is_empty() {
                    return Err(malformed("signal payload is empty"));
                }
                if payload.len() > config.max_payload_bytes {
                    return Err(payload_too_large(config));
                }
                Ok(InboundEvent::Signal { channel, payload })
            }
            ClientMessage::TalkStart => Ok(InboundEvent::TalkStart),
            ClientMessage::TalkStop => Ok(InboundEvent::TalkStop),
            ClientMessage::Leave => Ok(InboundEvent::Leave),
        }
    }
}

fn parse_channel(frequency: &str, config: &RelayConfig) -> Result<ChannelId> {
    let channel = ChannelId::new(frequency)?;
    if channel.as_str().chars().count() > config.max_channel_len {
        return Err(malformed(format!(
            "frequency longer than {} characters",
            config.max_channel_len
        )));
    }
    Ok(channel)
}

/// Byte length `encoded` decodes to, computed without decoding. Exact for
/// padded base64; invalid input is caught by the decoder afterwards.
fn decoded_len(encoded: &str) -> usize {
    let padding = encoded.bytes().rev().take(2).filter(|&b| b == b'=').count();
    (encoded.len() / 4 * 3).saturating_sub(padding)
}

fn payload_too_large(config: &RelayConfig) -> RelayError {
    malformed(format!(
        "signal payload exceeds {} bytes",
        config.max_payload_bytes
    ))
}

fn malformed(msg: impl Into<String>) -> RelayError {
    RelayError::MalformedEvent(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ClientMessage {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_join_parses_and_validates() {
        let msg = parse(r#"{"t":"join","frequency":"20","user_id":"alice"}"#);
        let event = msg.validate(&RelayConfig::default()).unwrap();
        assert_eq!(
            event,
            InboundEvent::Join {
                channel: ChannelId::new("20").unwrap(),
                user_id: "alice".to_string(),
            }
        );
    }

    #[test]
    fn test_join_accepts_camel_case_user_id() {
        let msg = parse(r#"{"t":"join","frequency":"20","userId":"bob"}"#);
        assert!(matches!(
            msg.validate(&RelayConfig::default()),
            Ok(InboundEvent::Join { user_id, .. }) if user_id == "bob"
        ));
    }

    #[test]
    fn test_join_rejects_missing_fields() {
        let config = RelayConfig::default();
        for json in [
            r#"{"t":"join","user_id":"alice"}"#,
            r#"{"t":"join","frequency":"  ","user_id":"alice"}"#,
            r#"{"t":"join","frequency":"20"}"#,
            r#"{"t":"join","frequency":"20","user_id":""}"#,
        ] {
            let err = parse(json).validate(&config).unwrap_err();
            assert_eq!(err.code(), "MALFORMED_EVENT", "{}", json);
        }
    }

    #[test]
    fn test_join_rejects_long_frequency() {
        let config = RelayConfig {
            max_channel_len: 4,
            ..RelayConfig::default()
        };
        let msg = parse(r#"{"t":"join","frequency":"12345","user_id":"alice"}"#);
        assert!(msg.validate(&config).is_err());
    }

    #[test]
    fn test_original_client_signal_shape() {
        let msg = parse(
            r#"{"t":"audio_signal","frequency":"20","signal":"audio_record.mp4","userId":"alice"}"#,
        );
        let event = msg.validate(&RelayConfig::default()).unwrap();
        assert_eq!(
            event,
            InboundEvent::Signal {
                channel: ChannelId::new("20").unwrap(),
                payload: Payload::Reference("audio_record.mp4".to_string()),
            }
        );
    }

    #[test]
    fn test_inline_signal_decodes_base64() {
        let msg = parse(r#"{"t":"signal","frequency":"20","data":"AQID"}"#);
        let event = msg.validate(&RelayConfig::default()).unwrap();
        assert!(matches!(
            event,
            InboundEvent::Signal { payload: Payload::Inline(bytes), .. } if bytes == [1u8, 2, 3]
        ));
    }

    #[test]
    fn test_signal_payload_rules() {
        let config = RelayConfig {
            max_payload_bytes: 4,
            ..RelayConfig::default()
        };
        for json in [
            r#"{"t":"signal","frequency":"20"}"#,
            r#"{"t":"signal","frequency":"20","signal":""}"#,
            r#"{"t":"signal","frequency":"20","signal":"a","data":"AQID"}"#,
            r#"{"t":"signal","frequency":"20","data":"not base64!"}"#,
            r#"{"t":"signal","frequency":"20","signal":"too long"}"#,
            r#"{"t":"signal","frequency":"","signal":"a"}"#,
        ] {
            assert!(parse(json).validate(&config).is_err(), "{}", json);
        }
    }

    #[test]
    fn test_oversized_data_rejected_before_decoding() {
        let config = RelayConfig {
            max_payload_bytes: 6,
            ..RelayConfig::default()
        };

        // Not valid base64, so only the size check can produce this error
        let json = format!(
            r#"{{"t":"signal","frequency":"20","data":"{}"}}"#,
            "!".repeat(64)
        );
        let err = parse(&json).validate(&config).unwrap_err();
        assert_eq!(
            err,
            RelayError::MalformedEvent("signal payload exceeds 6 bytes".to_string())
        );

        // Exactly at the limit: 6 bytes
        let msg = parse(r#"{"t":"signal","frequency":"20","data":"AQIDBAUG"}"#);
        assert!(msg.validate(&config).is_ok());

        // 5 bytes with padding also fits
        let msg = parse(r#"{"t":"signal","frequency":"20","data":"AQIDBAU="}"#);
        assert!(msg.validate(&config).is_ok());

        // 7 bytes does not
        let msg = parse(r#"{"t":"signal","frequency":"20","data":"AQIDBAUGBw=="}"#);
        assert!(msg.validate(&config).is_err());
    }

    #[test]
    fn test_decoded_len() {
        assert_eq!(decoded_len(""), 0);
        assert_eq!(decoded_len("AQID"), 3);
        assert_eq!(decoded_len("AQ=="), 1);
        assert_eq!(decoded_len("AQI="), 2);
        assert_eq!(decoded_len("AQIDBAUGBw=="), 7);
    }

    #[test]
    fn test_unit_messages() {
        assert_eq!(parse(r#"{"t":"talk_start"}"#), ClientMessage::TalkStart);
        assert_eq!(parse(r#"{"t":"talk_stop"}"#), ClientMessage::TalkStop);
        assert_eq!(parse(r#"{"t":"leave"}"#), ClientMessage::Leave);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"t":"shout"}"#).is_err());
    }

    #[test]
    fn test_outbound_signal_encoding() {
        let signal = Signal {
            channel: ChannelId::new("20").unwrap(),
            origin: ConnectionId::new(),
            user_id: "alice".to_string(),
            payload: Payload::Inline(vec![1, 2, 3]),
        };
        let json = serde_json::to_value(ServerMessage::from(&signal)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "t": "signal",
                "frequency": "20",
                "user_id": "alice",
                "data": "AQID",
            })
        );
    }

    #[test]
    fn test_error_frame() {
        let msg = ServerMessage::error(&RelayError::RateLimited);
        assert_eq!(
            msg,
            ServerMessage::Error {
                code: "RATE_LIMITED".to_string(),
                msg: "signal rate limit exceeded".to_string(),
            }
        );
    }
}
