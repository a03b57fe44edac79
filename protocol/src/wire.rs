//! Jupyter multipart message framing.
//!
//! A message on a ZeroMQ channel is a list of frames:
//!
//! ```text
//! [identities...] <IDS|MSG> signature header parent_header metadata content [buffers...]
//! ```
//!
//! The signature is the hex HMAC-SHA256 of the four JSON frames, keyed by the
//! connection descriptor's `key`. An empty key disables signing. Descriptors
//! naming any other `signature_scheme` are refused.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::descriptor::{ConnectionDescriptor, DEFAULT_SIGNATURE_SCHEME};

pub const DELIMITER: &[u8] = b"<IDS|MSG>";
pub const PROTOCOL_VERSION: &str = "5.3";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    MissingDelimiter,
    /// Fewer than the five frames that follow the delimiter.
    Truncated(usize),
    BadSignature,
    Json(String),
    UnsupportedScheme(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingDelimiter => write!(f, "no <IDS|MSG> delimiter in message"),
            Self::Truncated(n) => write!(f, "message truncated: {n} frames after delimiter"),
            Self::BadSignature => write!(f, "message signature mismatch"),
            Self::Json(e) => write!(f, "invalid message frame: {e}"),
            Self::UnsupportedScheme(s) => write!(f, "unsupported signature scheme: {s:?}"),
        }
    }
}

impl std::error::Error for WireError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// A decoded Jupyter message (identities excluded).
#[derive(Debug, Clone, PartialEq)]
pub struct JupyterMessage {
    pub header: Header,
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
    pub buffers: Vec<Vec<u8>>,
}

impl JupyterMessage {
    pub fn new(msg_type: &str, session: &str, content: Value) -> Self {
        Self {
            header: Header {
                msg_id: uuid::Uuid::new_v4().to_string(),
                session: session.to_string(),
                username: "spyder".to_string(),
                msg_type: msg_type.to_string(),
                version: PROTOCOL_VERSION.to_string(),
                date: None,
            },
            parent_header: json!({}),
            metadata: json!({}),
            content,
            buffers: Vec::new(),
        }
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Encode to frames, starting at the delimiter.
    pub fn to_frames(&self, signer: &Signer) -> Vec<Vec<u8>> {
        let mut parts = vec![
            json!(self.header).to_string().into_bytes(),
            self.parent_header.to_string().into_bytes(),
            self.metadata.to_string().into_bytes(),
            self.content.to_string().into_bytes(),
        ];
        let signature = signer.sign(&parts);
        parts.insert(0, signature.into_bytes());
        parts.insert(0, DELIMITER.to_vec());
        parts.extend(self.buffers.iter().cloned());
        parts
    }

    /// Decode frames, returning the routing identities and the message.
    pub fn from_frames(
        frames: &[Vec<u8>],
        signer: &Signer,
    ) -> Result<(Vec<Vec<u8>>, Self), WireError> {
        let split = frames
            .iter()
            .position(|f| f.as_slice() == DELIMITER)
            .ok_or(WireError::MissingDelimiter)?;
        let identities = frames[..split].to_vec();
        let rest = &frames[split + 1..];
        if rest.len() < 5 {
            return Err(WireError::Truncated(rest.len()));
        }
        if !signer.verify(&rest[0], &rest[1..5]) {
            return Err(WireError::BadSignature);
        }
        let parse = |b: &[u8]| -> Result<Value, WireError> {
            serde_json::from_slice(b).map_err(|e| WireError::Json(e.to_string()))
        };
        let header: Header =
            serde_json::from_slice(&rest[1]).map_err(|e| WireError::Json(e.to_string()))?;
        Ok((
            identities,
            Self {
                header,
                parent_header: parse(&rest[2])?,
                metadata: parse(&rest[3])?,
                content: parse(&rest[4])?,
                buffers: rest[5..].to_vec(),
            },
        ))
    }
}

/// HMAC-SHA256 signer for one connection key.
#[derive(Clone)]
pub struct Signer {
    mac: Option<Hmac<Sha256>>,
}

impl Signer {
    pub fn new(key: &[u8]) -> Self {
        let mac = if key.is_empty() {
            None
        } else {
            Hmac::<Sha256>::new_from_slice(key).ok()
        };
        Self { mac }
    }

    /// Signer for a descriptor's key and scheme.
    pub fn for_descriptor(descriptor: &ConnectionDescriptor) -> Result<Self, WireError> {
        if !descriptor
            .signature_scheme
            .eq_ignore_ascii_case(DEFAULT_SIGNATURE_SCHEME)
        {
            return Err(WireError::UnsupportedScheme(
                descriptor.signature_scheme.clone(),
            ));
        }
        Ok(Self::new(descriptor.hmac_key()))
    }

    pub fn sign(&self, parts: &[Vec<u8>]) -> String {
        match &self.mac {
            Some(mac) => {
                let mut mac = mac.clone();
                for part in parts {
                    mac.update(part);
                }
                hex::encode(mac.finalize().into_bytes())
            }
            None => String::new(),
        }
    }

    pub fn verify(&self, signature: &[u8], parts: &[Vec<u8>]) -> bool {
        let Some(mac) = &self.mac else {
            return true;
        };
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let mut mac = mac.clone();
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(&expected).is_ok()
    }
}
