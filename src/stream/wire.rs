use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::stream::error::{Result, StreamError};

pub const DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

/// How a frame is framed on the socket. A server emits exactly one of these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// One binary message carrying the JPEG bytes.
    #[default]
    Binary,
    /// One text message carrying `data:image/jpeg;base64,...`.
    DataUri,
}

/// Wrap an encoded JPEG in a socket message.
pub fn frame_message(jpeg: &Bytes, format: WireFormat) -> Message {
    match format {
        WireFormat::Binary => Message::Binary(jpeg.clone()),
        WireFormat::DataUri => {
            let mut text = String::with_capacity(DATA_URI_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
            text.push_str(DATA_URI_PREFIX);
            STANDARD.encode_string(jpeg, &mut text);
            Message::Text(text.into())
        }
    }
}

/// Extract the JPEG bytes from a received message.
///
/// Control messages yield `Ok(None)`. Text that is not a JPEG data URI is a
/// decode error.
pub fn frame_payload(msg: &Message) -> Result<Option<Bytes>> {
    match msg {
        Message::Binary(data) => Ok(Some(data.clone())),
        Message::Text(text) => {
            let encoded = text
                .as_str()
                .strip_prefix(DATA_URI_PREFIX)
                .ok_or_else(|| StreamError::Decode("text message is not a JPEG data URI".into()))?;
            STANDARD
                .decode(encoded)
                .map(|raw| Some(Bytes::from(raw)))
                .map_err(|e| StreamError::Decode(e.to_string()))
        }
        _ => Ok(None),
    }
}
