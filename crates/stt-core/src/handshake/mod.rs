//! Four-message authenticated handshake.
//!
//! Two nodes holding the same shared seed prove possession of it and derive
//! a common session id and session key:
//!
//! ```text
//! Initiator                         Responder
//!     |                                 |
//!     |--- HELLO {id, nonce, commit} -->|
//!     |                                 |
//!     |<-- CHALLENGE {id, nonce, ct} ---|
//!     |                                 |
//!     |--- AUTH_PROOF {sid, ct} ------->|
//!     |                                 |
//!     |<-- FINAL {sid, status} ---------|
//!     |                                 |
//!     |       [Session Active]          |
//! ```
//!
//! Fresh 32-byte nonces and a timestamp window give replay protection; a
//! decryption failure at any step aborts the exchange. The session id is
//! mixed from both nonces and both node ids; its uniqueness rests on the
//! randomness of the nonces, not on the XOR itself.

pub mod messages;
pub mod registry;

pub use messages::{
    ChallengeMessage, ConfirmMessage, HelloMessage, MAX_CLOCK_SKEW_MS, ProofMessage, STATUS_OK,
    check_timestamp, unix_millis,
};
pub use registry::HandshakeRegistry;

use crate::error::HandshakeError;
use crate::frame::{Frame, FrameType};
use crate::session::SessionId;
use std::collections::BTreeMap;
use stt_crypto::{SessionKey, TransmissionCrypto, random};

/// Reserved capability negotiation byte; zero in this version
const CAPABILITIES: [u8; 1] = [0];

/// Derive the session id both peers compute from handshake material:
/// the first 8 bytes of `XOR(nonce_i, nonce_r) || XOR(node_id_i, node_id_r)`.
#[must_use]
pub fn derive_session_id(
    nonce_i: &[u8; 32],
    nonce_r: &[u8; 32],
    node_id_i: &[u8; 32],
    node_id_r: &[u8; 32],
) -> SessionId {
    let mut mixed = [0u8; 64];
    for i in 0..32 {
        mixed[i] = nonce_i[i] ^ nonce_r[i];
        mixed[32 + i] = node_id_i[i] ^ node_id_r[i];
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&mixed[..8]);
    SessionId::from_bytes(id)
}

/// Assemble the handshake material both peers feed to session-key
/// derivation.
#[must_use]
pub fn handshake_material(
    node_id_i: &[u8; 32],
    node_id_r: &[u8; 32],
    nonce_i: &[u8; 32],
    nonce_r: &[u8; 32],
) -> BTreeMap<String, Vec<u8>> {
    let mut material = BTreeMap::new();
    material.insert("capabilities".to_string(), CAPABILITIES.to_vec());
    material.insert("node_id_i".to_string(), node_id_i.to_vec());
    material.insert("node_id_r".to_string(), node_id_r.to_vec());
    material.insert("nonce_i".to_string(), nonce_i.to_vec());
    material.insert("nonce_r".to_string(), nonce_r.to_vec());
    material
}

fn challenge_aad(node_id_i: &[u8; 32], node_id_r: &[u8; 32]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(9 + 64);
    aad.extend_from_slice(b"challenge");
    aad.extend_from_slice(node_id_i);
    aad.extend_from_slice(node_id_r);
    aad
}

fn proof_aad(node_id_i: &[u8; 32], node_id_r: &[u8; 32]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(5 + 64);
    aad.extend_from_slice(b"proof");
    aad.extend_from_slice(node_id_i);
    aad.extend_from_slice(node_id_r);
    aad
}

fn commitment_input(node_id: &[u8; 32], nonce: &[u8; 32]) -> [u8; 64] {
    let mut input = [0u8; 64];
    input[..32].copy_from_slice(node_id);
    input[32..].copy_from_slice(nonce);
    input
}

/// Result of a completed handshake, ready for session construction.
pub struct HandshakeOutcome {
    /// The agreed session id
    pub session_id: SessionId,
    /// The derived session key
    pub session_key: SessionKey,
    /// The peer's node id
    pub peer_node_id: [u8; 32],
}

/// Initiator-side states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    /// HELLO sent, awaiting CHALLENGE
    SentHello,
    /// AUTH_PROOF sent, awaiting FINAL
    SentProof,
    /// Terminal success
    Confirmed,
    /// Terminal failure
    Failed,
}

impl InitiatorState {
    fn as_str(self) -> &'static str {
        match self {
            Self::SentHello => "SentHello",
            Self::SentProof => "SentProof",
            Self::Confirmed => "Confirmed",
            Self::Failed => "Failed",
        }
    }
}

/// Responder-side states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    /// CHALLENGE sent, awaiting AUTH_PROOF
    SentChallenge,
    /// Terminal success
    SentConfirm,
    /// Terminal failure
    Failed,
}

/// One side of an in-flight handshake, initiator role.
pub struct InitiatorHandshake {
    local_node_id: [u8; 32],
    nonce: [u8; 32],
    state: InitiatorState,
    peer_node_id: Option<[u8; 32]>,
    peer_nonce: Option<[u8; 32]>,
    tentative_session_id: Option<SessionId>,
}

impl InitiatorHandshake {
    /// Begin a handshake: generate the nonce and build the HELLO frame.
    ///
    /// # Errors
    ///
    /// Returns a `CryptoError` if nonce generation fails.
    pub fn start(
        crypto: &TransmissionCrypto,
        local_node_id: [u8; 32],
    ) -> Result<(Self, Frame), HandshakeError> {
        let nonce = random::random_32()?;
        let commitment = crypto.hash(&commitment_input(&local_node_id, &nonce));

        let hello = HelloMessage {
            node_id: local_node_id,
            nonce,
            timestamp_ms: unix_millis(),
            commitment,
        };
        let mut frame = Frame::new(FrameType::Hello, SessionId::ZERO);
        frame.payload = hello.encode()?;

        Ok((
            Self {
                local_node_id,
                nonce,
                state: InitiatorState::SentHello,
                peer_node_id: None,
                peer_nonce: None,
                tentative_session_id: None,
            },
            frame,
        ))
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> InitiatorState {
        self.state
    }

    /// Session id derived from the challenge, once known
    #[must_use]
    pub fn tentative_session_id(&self) -> Option<SessionId> {
        self.tentative_session_id
    }

    /// Process the responder's CHALLENGE and build the AUTH_PROOF frame.
    ///
    /// # Errors
    ///
    /// Any failed check poisons the handshake: the state becomes `Failed`
    /// and the error is surfaced to `connect`.
    pub fn on_challenge(
        &mut self,
        crypto: &TransmissionCrypto,
        frame: &Frame,
    ) -> Result<Frame, HandshakeError> {
        if self.state != InitiatorState::SentHello {
            return Err(HandshakeError::UnexpectedMessage {
                got: "CHALLENGE",
                state: self.state.as_str(),
            });
        }

        match self.process_challenge(crypto, frame) {
            Ok(proof) => {
                self.state = InitiatorState::SentProof;
                Ok(proof)
            }
            Err(e) => {
                self.state = InitiatorState::Failed;
                Err(e)
            }
        }
    }

    fn process_challenge(
        &mut self,
        crypto: &TransmissionCrypto,
        frame: &Frame,
    ) -> Result<Frame, HandshakeError> {
        let challenge = ChallengeMessage::decode(&frame.payload)?;
        check_timestamp(challenge.timestamp_ms)?;

        let aad = challenge_aad(&self.local_node_id, &challenge.node_id);
        let plaintext = crypto.decrypt(&challenge.ciphertext, &challenge.metadata, &aad)?;
        if plaintext.len() != 64
            || plaintext[..32] != self.nonce
            || plaintext[32..] != challenge.nonce
        {
            return Err(HandshakeError::ChallengeMismatch);
        }

        let session_id = derive_session_id(
            &self.nonce,
            &challenge.nonce,
            &self.local_node_id,
            &challenge.node_id,
        );

        let proof_tag = proof_aad(&self.local_node_id, &challenge.node_id);
        let (ciphertext, metadata) = crypto.encrypt(session_id.as_bytes(), &proof_tag)?;

        self.peer_node_id = Some(challenge.node_id);
        self.peer_nonce = Some(challenge.nonce);
        self.tentative_session_id = Some(session_id);

        let proof = ProofMessage {
            session_id,
            ciphertext,
            metadata,
            timestamp_ms: unix_millis(),
        };
        let mut frame = Frame::new(FrameType::Proof, SessionId::ZERO);
        frame.payload = proof.encode()?;
        Ok(frame)
    }

    /// Process the responder's FINAL and produce the session material.
    ///
    /// # Errors
    ///
    /// Any failed check poisons the handshake and surfaces the error.
    pub fn on_confirm(
        &mut self,
        crypto: &TransmissionCrypto,
        frame: &Frame,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        if self.state != InitiatorState::SentProof {
            return Err(HandshakeError::UnexpectedMessage {
                got: "FINAL",
                state: self.state.as_str(),
            });
        }

        match self.process_confirm(crypto, frame) {
            Ok(outcome) => {
                self.state = InitiatorState::Confirmed;
                Ok(outcome)
            }
            Err(e) => {
                self.state = InitiatorState::Failed;
                Err(e)
            }
        }
    }

    fn process_confirm(
        &mut self,
        crypto: &TransmissionCrypto,
        frame: &Frame,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let confirm = ConfirmMessage::decode(&frame.payload)?;
        check_timestamp(confirm.timestamp_ms)?;
        if confirm.status != STATUS_OK {
            return Err(HandshakeError::Rejected(confirm.status));
        }

        // Both were set when the challenge was processed.
        let session_id = self
            .tentative_session_id
            .ok_or(HandshakeError::SessionIdMismatch)?;
        let peer_node_id = self.peer_node_id.ok_or(HandshakeError::SessionIdMismatch)?;
        let peer_nonce = self.peer_nonce.ok_or(HandshakeError::SessionIdMismatch)?;

        if confirm.session_id != session_id {
            return Err(HandshakeError::SessionIdMismatch);
        }

        let material = handshake_material(
            &self.local_node_id,
            &peer_node_id,
            &self.nonce,
            &peer_nonce,
        );
        Ok(HandshakeOutcome {
            session_id,
            session_key: crypto.derive_session_key(&material),
            peer_node_id,
        })
    }
}

/// One side of an in-flight handshake, responder role.
pub struct ResponderHandshake {
    local_node_id: [u8; 32],
    nonce: [u8; 32],
    peer_node_id: [u8; 32],
    peer_nonce: [u8; 32],
    state: ResponderState,
    tentative_session_id: SessionId,
}

impl ResponderHandshake {
    /// Process a HELLO and build the CHALLENGE frame.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed HELLO, a stale timestamp, or a
    /// commitment mismatch; the caller drops silently.
    pub fn respond(
        crypto: &TransmissionCrypto,
        local_node_id: [u8; 32],
        frame: &Frame,
    ) -> Result<(Self, Frame), HandshakeError> {
        let hello = HelloMessage::decode(&frame.payload)?;
        check_timestamp(hello.timestamp_ms)?;

        let expected = crypto.hash(&commitment_input(&hello.node_id, &hello.nonce));
        if expected != hello.commitment {
            return Err(HandshakeError::CommitmentMismatch);
        }

        let nonce = random::random_32()?;
        let mut plaintext = [0u8; 64];
        plaintext[..32].copy_from_slice(&hello.nonce);
        plaintext[32..].copy_from_slice(&nonce);

        let aad = challenge_aad(&hello.node_id, &local_node_id);
        let (ciphertext, metadata) = crypto.encrypt(&plaintext, &aad)?;

        let tentative_session_id =
            derive_session_id(&hello.nonce, &nonce, &hello.node_id, &local_node_id);

        let challenge = ChallengeMessage {
            node_id: local_node_id,
            nonce,
            ciphertext,
            metadata,
            timestamp_ms: unix_millis(),
        };
        let mut out = Frame::new(FrameType::Challenge, SessionId::ZERO);
        out.payload = challenge.encode()?;

        Ok((
            Self {
                local_node_id,
                nonce,
                peer_node_id: hello.node_id,
                peer_nonce: hello.nonce,
                state: ResponderState::SentChallenge,
                tentative_session_id,
            },
            out,
        ))
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ResponderState {
        self.state
    }

    /// The session id this responder expects the proof to contain
    #[must_use]
    pub fn tentative_session_id(&self) -> SessionId {
        self.tentative_session_id
    }

    /// Process the AUTH_PROOF and build the FINAL frame plus the session
    /// material.
    ///
    /// # Errors
    ///
    /// Any failed check poisons the handshake; the caller drops silently.
    pub fn on_proof(
        &mut self,
        crypto: &TransmissionCrypto,
        frame: &Frame,
    ) -> Result<(Frame, HandshakeOutcome), HandshakeError> {
        if self.state != ResponderState::SentChallenge {
            return Err(HandshakeError::UnexpectedMessage {
                got: "AUTH_PROOF",
                state: "SentConfirm",
            });
        }

        match self.process_proof(crypto, frame) {
            Ok(result) => {
                self.state = ResponderState::SentConfirm;
                Ok(result)
            }
            Err(e) => {
                self.state = ResponderState::Failed;
                Err(e)
            }
        }
    }

    fn process_proof(
        &mut self,
        crypto: &TransmissionCrypto,
        frame: &Frame,
    ) -> Result<(Frame, HandshakeOutcome), HandshakeError> {
        let proof = ProofMessage::decode(&frame.payload)?;
        check_timestamp(proof.timestamp_ms)?;

        let aad = proof_aad(&self.peer_node_id, &self.local_node_id);
        let plaintext = crypto.decrypt(&proof.ciphertext, &proof.metadata, &aad)?;
        if plaintext.as_slice() != self.tentative_session_id.as_bytes()
            || proof.session_id != self.tentative_session_id
        {
            return Err(HandshakeError::SessionIdMismatch);
        }

        let confirm = ConfirmMessage {
            session_id: self.tentative_session_id,
            status: STATUS_OK,
            timestamp_ms: unix_millis(),
        };
        let mut out = Frame::new(FrameType::Confirm, SessionId::ZERO);
        out.payload = confirm.encode()?;

        let material = handshake_material(
            &self.peer_node_id,
            &self.local_node_id,
            &self.peer_nonce,
            &self.nonce,
        );
        let outcome = HandshakeOutcome {
            session_id: self.tentative_session_id,
            session_key: crypto.derive_session_key(&material),
            peer_node_id: self.peer_node_id,
        };
        Ok((out, outcome))
    }
}
