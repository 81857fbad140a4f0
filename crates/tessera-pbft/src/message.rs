//! PBFT wire messages.
//!
//! Every message travels as one pipe-delimited text record:
//!
//! ```text
//! type|sender|digest|content|hex(R):hex(S)
//! ```
//!
//! The content field is always present (possibly empty); the signature field
//! is omitted for unsigned messages. `digest` is the 64-character hex digest
//! the message is about: the request digest for the agreement phases, and the
//! hash of the content for control messages.
//!
//! ## Agreement
//! - `PRE-PREPARE` - Primary → All: order this request (content = payload)
//! - `PREPARE` - All → All: I accept the pre-prepare
//! - `COMMIT` - All → All: I hold a prepare quorum
//!
//! ## Control
//! - `CLIENT-REQUEST` - Client/Replica → Primary: please order this payload
//! - `ACK` - Receiver → Sender: your PRE-PREPARE / CLIENT-REQUEST arrived
//! - `VIEW-CHANGE` - Replica → All: I propose view `v`
//! - `STATE-REQUEST` - Replica → All: my state root at checkpoint `seq`
//! - `CHECKPOINT-SYNC` - Replica → Requester: the values behind my root
//! - `MEMBERSHIP-UPDATE` - Replica → All: add or remove a replica
//! - `FAULT-DETECTION` - Replica → All: these replicas look unresponsive
//!
//! Content codecs for the structured control payloads live at the bottom of
//! this module.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessera_crypto::{PublicKey, Signature, SignatureService, sha256_str};
use tessera_types::{Digest, ReplicaId, SequenceNumber, ViewNumber};

use crate::{Error, Result};

/// Field separator of the wire format.
const FIELD_SEPARATOR: char = '|';

// ============================================================================
// Message Kind
// ============================================================================

/// The type tag of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    PrePrepare,
    Prepare,
    Commit,
    ViewChange,
    CheckpointSync,
    StateRequest,
    ClientRequest,
    MembershipUpdate,
    Ack,
    FaultDetection,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        MessageKind::PrePrepare,
        MessageKind::Prepare,
        MessageKind::Commit,
        MessageKind::ViewChange,
        MessageKind::CheckpointSync,
        MessageKind::StateRequest,
        MessageKind::ClientRequest,
        MessageKind::MembershipUpdate,
        MessageKind::Ack,
        MessageKind::FaultDetection,
    ];

    /// Returns the wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::PrePrepare => "PRE-PREPARE",
            MessageKind::Prepare => "PREPARE",
            MessageKind::Commit => "COMMIT",
            MessageKind::ViewChange => "VIEW-CHANGE",
            MessageKind::CheckpointSync => "CHECKPOINT-SYNC",
            MessageKind::StateRequest => "STATE-REQUEST",
            MessageKind::ClientRequest => "CLIENT-REQUEST",
            MessageKind::MembershipUpdate => "MEMBERSHIP-UPDATE",
            MessageKind::Ack => "ACK",
            MessageKind::FaultDetection => "FAULT-DETECTION",
        }
    }

    /// Kinds the receiver acknowledges with a direct `ACK`.
    pub fn requires_ack(self) -> bool {
        matches!(self, MessageKind::PrePrepare | MessageKind::ClientRequest)
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::malformed(format!("unknown message type {s:?}")))
    }
}

// ============================================================================
// Message
// ============================================================================

/// A wire message.
///
/// Immutable once sent: [`Message::with_content`] and [`Message::sign`]
/// consume and return the message, so content can only be attached while
/// the sender still owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub sender: ReplicaId,
    pub digest: Digest,
    pub content: Option<String>,
    pub signature: Option<Signature>,
}

impl Message {
    /// Creates an unsigned message without content.
    pub fn new(kind: MessageKind, sender: ReplicaId, digest: Digest) -> Self {
        Self {
            kind,
            sender,
            digest,
            content: None,
            signature: None,
        }
    }

    /// Creates a control message whose digest is the hash of its content.
    pub fn control(kind: MessageKind, sender: ReplicaId, content: impl Into<String>) -> Result<Self> {
        let content = content.into();
        Message::new(kind, sender, sha256_str(&content)).with_content(content)
    }

    /// Attaches content. Empty content is the same as none.
    ///
    /// Content containing the field separator cannot be framed and is
    /// rejected.
    pub fn with_content(mut self, content: impl Into<String>) -> Result<Self> {
        let content = content.into();
        if content.contains(FIELD_SEPARATOR) {
            return Err(Error::malformed("content must not contain '|'"));
        }
        self.content = if content.is_empty() { None } else { Some(content) };
        Ok(self)
    }

    /// Returns the content, or `""` when absent.
    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// The bytes a signature covers: type, sender, digest and, if present,
    /// content.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = format!("{}|{}|{}", self.kind, self.sender, self.digest);
        if let Some(content) = &self.content {
            payload.push(FIELD_SEPARATOR);
            payload.push_str(content);
        }
        payload.into_bytes()
    }

    /// Signs the message as its sender.
    pub fn sign(mut self, signatures: &dyn SignatureService) -> Result<Self> {
        let signature = signatures.sign(self.sender, &self.signing_payload())?;
        self.signature = Some(signature);
        Ok(self)
    }

    /// Returns true if the message carries a signature by its sender.
    pub fn verify(&self, signatures: &dyn SignatureService) -> bool {
        self.signature
            .as_ref()
            .is_some_and(|sig| signatures.verify(sig, &self.signing_payload(), self.sender))
    }

    /// Encodes to the canonical wire form.
    pub fn encode(&self) -> String {
        let mut wire = format!(
            "{}|{}|{}|{}",
            self.kind,
            self.sender,
            self.digest,
            self.content_str()
        );
        if let Some(signature) = &self.signature {
            wire.push(FIELD_SEPARATOR);
            wire.push_str(&signature.to_wire());
        }
        wire
    }

    /// Decodes the wire form.
    ///
    /// Fails with [`Error::MalformedMessage`] when fewer than four fields are
    /// present or the type, sender, digest or signature does not parse.
    pub fn decode(wire: &str) -> Result<Self> {
        let fields: Vec<&str> = wire.splitn(5, FIELD_SEPARATOR).collect();
        let [kind, sender, digest, content, rest @ ..] = fields.as_slice() else {
            return Err(Error::malformed(format!(
                "expected at least 4 fields, got {}",
                fields.len()
            )));
        };

        let kind: MessageKind = kind.parse()?;
        let sender: ReplicaId = sender
            .parse()
            .map_err(|_| Error::malformed(format!("unparsable sender id {sender:?}")))?;
        let digest = Digest::from_hex(digest)
            .map_err(|e| Error::malformed(format!("bad digest: {e}")))?;
        let signature = match rest {
            [] => None,
            [sig] => Some(
                Signature::from_wire(sig)
                    .map_err(|e| Error::malformed(format!("bad signature block: {e}")))?,
            ),
            _ => unreachable!("splitn(5) yields at most 5 fields"),
        };

        Ok(Self {
            kind,
            sender,
            digest,
            content: (!content.is_empty()).then(|| (*content).to_string()),
            signature,
        })
    }

    /// Decodes a frame received from the transport.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        let wire = std::str::from_utf8(bytes)
            .map_err(|e| Error::malformed(format!("frame is not UTF-8: {e}")))?;
        Self::decode(wire)
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} ({})", self.kind, self.sender, self.digest)
    }
}

// ============================================================================
// Content codecs
// ============================================================================

/// `VIEW-CHANGE` content: the proposed view number.
pub fn encode_view(view: ViewNumber) -> String {
    view.to_string()
}

pub fn decode_view(content: &str) -> Result<ViewNumber> {
    content
        .parse()
        .map_err(|_| Error::malformed(format!("bad view number {content:?}")))
}

/// `STATE-REQUEST` content: `sequence:root`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRequest {
    pub sequence: SequenceNumber,
    pub root: Digest,
}

impl Display for StateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sequence, self.root)
    }
}

impl FromStr for StateRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (sequence, root) = s
            .split_once(':')
            .ok_or_else(|| Error::malformed("state request must be sequence:root"))?;
        Ok(Self {
            sequence: sequence
                .parse()
                .map_err(|_| Error::malformed(format!("bad sequence number {sequence:?}")))?,
            root: Digest::from_hex(root)
                .map_err(|e| Error::malformed(format!("bad state root: {e}")))?,
        })
    }
}

/// `CHECKPOINT-SYNC` content: `root:value,value,...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub root: Digest,
    pub values: Vec<String>,
}

impl Display for StateUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.root, self.values.join(","))
    }
}

impl FromStr for StateUpdate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (root, values) = s
            .split_once(':')
            .ok_or_else(|| Error::malformed("state update must be root:values"))?;
        let root =
            Digest::from_hex(root).map_err(|e| Error::malformed(format!("bad state root: {e}")))?;
        let values = if values.is_empty() {
            Vec::new()
        } else {
            values.split(',').map(str::to_string).collect()
        };
        Ok(Self { root, values })
    }
}

/// `MEMBERSHIP-UPDATE` content: `ADD:<id>:<hex key>` or `REMOVE:<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add { id: ReplicaId, key: PublicKey },
    Remove { id: ReplicaId },
}

impl MembershipChange {
    pub fn id(&self) -> ReplicaId {
        match self {
            MembershipChange::Add { id, .. } | MembershipChange::Remove { id } => *id,
        }
    }
}

impl Display for MembershipChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipChange::Add { id, key } => write!(f, "ADD:{id}:{}", key.to_hex()),
            MembershipChange::Remove { id } => write!(f, "REMOVE:{id}"),
        }
    }
}

impl FromStr for MembershipChange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse_id = |id: &str| -> Result<ReplicaId> {
            id.parse()
                .map_err(|_| Error::malformed(format!("bad replica id {id:?}")))
        };

        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("ADD"), Some(id), Some(key)) => Ok(MembershipChange::Add {
                id: parse_id(id)?,
                key: PublicKey::from_hex(key)
                    .map_err(|e| Error::malformed(format!("bad public key: {e}")))?,
            }),
            (Some("REMOVE"), Some(id), None) => Ok(MembershipChange::Remove { id: parse_id(id)? }),
            _ => Err(Error::malformed(format!("bad membership update {s:?}"))),
        }
    }
}

/// `FAULT-DETECTION` content: comma-separated replica ids.
pub fn encode_fault_report(faulty: &[ReplicaId]) -> String {
    faulty
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn decode_fault_report(content: &str) -> Result<Vec<ReplicaId>> {
    if content.is_empty() {
        return Ok(Vec::new());
    }
    content
        .split(',')
        .map(|id| {
            id.parse()
                .map_err(|_| Error::malformed(format!("bad replica id {id:?} in fault report")))
        })
        .collect()
}
