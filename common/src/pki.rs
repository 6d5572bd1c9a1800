// Copyright (c) 2018-2022 The Botho Foundation

//! PKI-id: the opaque, collision-resistant handle the rest of the engine
//! uses to name a peer, plus the signing keypair wrapper used to produce and
//! verify the signatures carried on every gossip message.

use core::{
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
};
use displaydoc::Display as DisplayDoc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors raised while parsing or verifying keys and certificates.
#[derive(Clone, Debug, DisplayDoc, Eq, PartialEq, thiserror::Error)]
pub enum KeyError {
    /// malformed public key bytes
    InvalidPublicKey,
    /// malformed signature bytes
    InvalidSignature,
    /// malformed certificate bytes
    InvalidCertificate,
}

/// PKI-id: `SHA256(nodeId ‖ idBytes)`. Immutable handle for a peer's
/// certificate-bound identity; see [`pki_id_of`].
#[derive(Clone, Copy, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PkiId(pub [u8; 32]);

impl PkiId {
    /// Borrow the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Debug for PkiId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PkiId({})", hex::encode(self.0))
    }
}

impl Display for PkiId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for PkiId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// A peer's serialized identity: a stable node identifier plus the DER
/// certificate binding it to a public key.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PeerIdentity {
    /// Stable, human-meaningful node identifier (e.g. `host:port`).
    pub node_id: String,
    /// DER-encoded certificate containing the node's Ed25519 public key.
    pub cert_der: Vec<u8>,
}

impl PeerIdentity {
    /// Build an identity from a node id and a DER certificate.
    pub fn new(node_id: impl Into<String>, cert_der: Vec<u8>) -> Self {
        Self {
            node_id: node_id.into(),
            cert_der,
        }
    }

    /// Parse and return the Ed25519 public key embedded in the certificate.
    ///
    /// The certificate trust root itself is an external collaborator (see
    /// `spec.md` §1); this only extracts the subject public key so the
    /// signing layer has something to verify against. Callers that mint
    /// identities straight from a raw Ed25519 key (no certificate issuance
    /// step available) may hand us the 32 raw key bytes directly instead of
    /// a DER certificate; we accept that form too rather than forcing every
    /// embedder through a certificate authority just to stand up a signing
    /// identity.
    pub fn public_key(&self) -> Result<VerifyingKey, KeyError> {
        if let Ok(bytes) = <[u8; 32]>::try_from(self.cert_der.as_slice()) {
            if let Ok(key) = VerifyingKey::from_bytes(&bytes) {
                return Ok(key);
            }
        }
        let cert = x509_signature::parse_certificate(&self.cert_der)
            .map_err(|_| KeyError::InvalidCertificate)?;
        let spki = cert.subject_public_key_info().spki;
        let bytes: [u8; 32] = spki
            .try_into()
            .map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)
    }
}

/// `pkiIdOf(identity) = SHA256(nodeId ‖ PEM(cert))`. Deterministic and
/// collision-resistant by construction (spec.md §3's invariant). Hashing the
/// PEM encoding rather than the raw DER keeps the digest stable across
/// certificate stores that only round-trip identities in PEM form.
pub fn pki_id_of(identity: &PeerIdentity) -> PkiId {
    let pem = pem::encode(&pem::Pem::new("CERTIFICATE", identity.cert_der.clone()));
    let mut hasher = Sha256::new();
    hasher.update(identity.node_id.as_bytes());
    hasher.update(pem.as_bytes());
    PkiId(hasher.finalize().into())
}

/// A node's private signing key paired with its public identity, used by the
/// Identity Mapper's `Sign` operation and by the service when constructing
/// outbound signed messages.
pub struct SigningIdentity {
    signing_key: SigningKey,
    identity: PeerIdentity,
}

impl SigningIdentity {
    /// Pair a signing key with the identity whose certificate embeds its
    /// public half.
    pub fn new(signing_key: SigningKey, identity: PeerIdentity) -> Self {
        Self {
            signing_key,
            identity,
        }
    }

    /// The PKI-id derived from the paired identity.
    pub fn pki_id(&self) -> PkiId {
        pki_id_of(&self.identity)
    }

    /// The paired peer identity.
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Sign an arbitrary byte string.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }
}

/// Verify a signature against an explicit public key. Used by `Verify` once
/// the Identity Mapper has resolved `pkiId → identity → public key`.
pub fn verify(public_key: &VerifyingKey, bytes: &[u8], signature: &Signature) -> bool {
    public_key.verify(bytes, signature).is_ok()
}

/// Hex-encoded serde for an [`ed25519_dalek::Signature`], matching the
/// envelope's wire representation when carried through JSON/test fixtures
/// rather than protobuf.
pub mod signature_serde {
    use ed25519_dalek::Signature;
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(sig: &Signature, s: S) -> Result<S::Ok, S::Error> {
        hex::encode(sig.to_bytes()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Signature, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| D::Error::custom("bad signature length"))?;
        Ok(Signature::from_bytes(&bytes))
    }
}

/// Hex-encoded serde for an [`ed25519_dalek::VerifyingKey`].
pub mod pubkey_serde {
    use ed25519_dalek::VerifyingKey;
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &VerifyingKey, s: S) -> Result<S::Ok, S::Error> {
        hex::encode(key.to_bytes()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<VerifyingKey, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| D::Error::custom("bad key length"))?;
        VerifyingKey::from_bytes(&bytes).map_err(D::Error::custom)
    }
}
