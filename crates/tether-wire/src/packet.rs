//! Packets carried inside frames
//!
//! Binary fields (keys, signatures, ciphertext) travel as lowercase hex.

use serde::{Deserialize, Serialize};

use tether_core::{CoreId, Fingerprint, Nonce, RequestId, TetherError, TetherResult};

/// Handshake message type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeKind {
    Hello,
    HelloAck,
    KeyExchange,
    KeyExchangeAck,
}

impl HandshakeKind {
    pub fn to_byte(self) -> u8 {
        match self {
            HandshakeKind::Hello => 0x01,
            HandshakeKind::HelloAck => 0x02,
            HandshakeKind::KeyExchange => 0x03,
            HandshakeKind::KeyExchangeAck => 0x04,
        }
    }
}

/// Handshake / key exchange message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    #[serde(rename = "type")]
    pub kind: HandshakeKind,
    /// Sender
    pub core_id: CoreId,
    /// Fresh nonce of the sender
    pub nonce: Nonce,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_opt")]
    pub public_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_opt")]
    pub signature: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_opt")]
    pub encrypted_session_key: Option<Vec<u8>>,
    /// Epoch of the key carried by a key exchange
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u32>,
    /// Key confirmation carried by a key exchange ack
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_opt")]
    pub proof: Option<Vec<u8>>,
}

impl HandshakeMessage {
    pub fn new(kind: HandshakeKind, core_id: CoreId, nonce: Nonce) -> Self {
        HandshakeMessage {
            kind,
            core_id,
            nonce,
            fingerprint: None,
            public_key: None,
            signature: None,
            encrypted_session_key: None,
            epoch: None,
            proof: None,
        }
    }

    pub fn with_identity(mut self, fingerprint: Fingerprint, public_key: [u8; 32]) -> Self {
        self.fingerprint = Some(fingerprint);
        self.public_key = Some(public_key.to_vec());
        self
    }

    pub fn with_signature(mut self, signature: [u8; 64]) -> Self {
        self.signature = Some(signature.to_vec());
        self
    }

    pub fn with_session_key(mut self, epoch: u32, encrypted_key: Vec<u8>) -> Self {
        self.epoch = Some(epoch);
        self.encrypted_session_key = Some(encrypted_key);
        self
    }

    pub fn with_proof(mut self, epoch: u32, proof: Vec<u8>) -> Self {
        self.epoch = Some(epoch);
        self.proof = Some(proof);
        self
    }

    /// Bytes covered by the sender's signature
    ///
    /// Binds the message type, sender, both nonces and the claimed fingerprint.
    pub fn transcript(&self, peer_nonce: Option<&Nonce>) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(b"tether-hs-v1");
        out.push(self.kind.to_byte());
        out.extend_from_slice(&self.core_id.to_bytes());
        out.extend_from_slice(self.nonce.as_bytes());
        if let Some(peer) = peer_nonce {
            out.extend_from_slice(peer.as_bytes());
        }
        if let Some(fp) = &self.fingerprint {
            out.extend_from_slice(fp.as_bytes());
        }
        out
    }
}

/// Direction of an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Encrypted dispatch envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender
    pub core_id: CoreId,
    pub request_id: RequestId,
    /// Session key epoch used for the ciphertext
    pub epoch: u32,
    /// Single-use nonce, checked for replay by the receiver
    pub nonce: Nonce,
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Associated data binding the ciphertext to this envelope's header
    pub fn aad(
        direction: Direction,
        core_id: CoreId,
        request_id: RequestId,
        epoch: u32,
        nonce: &Nonce,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(36);
        out.extend_from_slice(match direction {
            Direction::Request => b"req",
            Direction::Response => b"rsp",
        });
        out.extend_from_slice(&core_id.to_bytes());
        out.extend_from_slice(&request_id.to_bytes());
        out.extend_from_slice(&epoch.to_be_bytes());
        out.extend_from_slice(nonce.as_bytes());
        out
    }

    pub fn header_aad(&self, direction: Direction) -> Vec<u8> {
        Self::aad(direction, self.core_id, self.request_id, self.epoch, &self.nonce)
    }
}

/// Plaintext of a request envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBody {
    pub operation: String,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

/// Plaintext of a response envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResponseBody {
    Ok {
        #[serde(with = "hex_bytes")]
        payload: Vec<u8>,
    },
    Err {
        message: String,
    },
}

impl ResponseBody {
    pub fn into_result(self) -> Result<Vec<u8>, String> {
        match self {
            ResponseBody::Ok { payload } => Ok(payload),
            ResponseBody::Err { message } => Err(message),
        }
    }
}

impl From<Result<Vec<u8>, String>> for ResponseBody {
    fn from(result: Result<Vec<u8>, String>) -> Self {
        match result {
            Ok(payload) => ResponseBody::Ok { payload },
            Err(message) => ResponseBody::Err { message },
        }
    }
}

/// Why a peer refused an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    /// No session or authentication failed
    Decryption,
    /// Nonce already seen
    Replay,
    /// Undecodable content
    Malformed,
    /// Handshake or rotation refused
    Handshake,
}

/// Refusal sent instead of a response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub core_id: CoreId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub kind: RejectKind,
    pub reason: String,
}

/// Top-level frame payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "packet", rename_all = "snake_case")]
pub enum Packet {
    Handshake(HandshakeMessage),
    Request(Envelope),
    Response(Envelope),
    Reject(Rejection),
    Ping { probe_id: u64 },
    Pong { probe_id: u64 },
}

impl Packet {
    pub fn to_bytes(&self) -> TetherResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TetherError::Wire(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        serde_json::from_slice(data).map_err(|e| TetherError::Wire(e.to_string()))
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Handshake(_) => "handshake",
            Packet::Request(_) => "request",
            Packet::Response(_) => "response",
            Packet::Reject(_) => "reject",
            Packet::Ping { .. } => "ping",
            Packet::Pong { .. } => "pong",
        }
    }
}

impl RequestBody {
    pub fn to_bytes(&self) -> TetherResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TetherError::Wire(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        serde_json::from_slice(data).map_err(|e| TetherError::Wire(e.to_string()))
    }
}

impl ResponseBody {
    pub fn to_bytes(&self) -> TetherResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TetherError::Wire(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        serde_json::from_slice(data).map_err(|e| TetherError::Wire(e.to_string()))
    }
}

mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(de::Error::custom)
    }
}

mod hex_opt {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(de::Error::custom))
            .transpose()
    }
}
