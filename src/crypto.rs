//! Signing identities and content hashing.
//!
//! An [`AgentSecret`] is the write side of an identity: it signs the hash
//! chain of every session the agent opens. The public side, [`AgentId`], is
//! embedded in each [`SessionId`](crate::covalue::SessionId), so any replica
//! holding a session id can verify that session's signatures without a key
//! lookup.

use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display},
    str::FromStr,
};

use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Hash the given bytes.
    pub fn new(data: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(data.as_ref()).as_bytes())
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Construct from raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Shortened base32 form for logging.
    pub fn fmt_short(&self) -> String {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0[..5]);
        text.make_ascii_lowercase();
        text
    }
}

impl From<blake3::Hash> for Hash {
    fn from(value: blake3::Hash) -> Self {
        Self(value.into())
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0);
        text.make_ascii_lowercase();
        write!(f, "{}", text)
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.fmt_short())
    }
}

/// The signing half of an agent identity.
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentSecret {
    priv_key: SigningKey,
}

impl AgentSecret {
    /// Generate a fresh agent key.
    pub fn new<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let priv_key = SigningKey::generate(rng);
        AgentSecret { priv_key }
    }

    /// Construct from the 32 secret key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        SigningKey::from_bytes(bytes).into()
    }

    /// The secret key byte representation.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.priv_key.to_bytes()
    }

    /// The public identity of this agent.
    pub fn id(&self) -> AgentId {
        AgentId(self.priv_key.verifying_key())
    }

    /// Sign a message with this agent's key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.priv_key.sign(msg)
    }
}

impl From<SigningKey> for AgentSecret {
    fn from(priv_key: SigningKey) -> Self {
        Self { priv_key }
    }
}

impl Display for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentSecret({})", hex::encode(self.priv_key.to_bytes()))
    }
}

impl Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print the secret bytes in debug output
        write!(f, "AgentSecret({})", self.id())
    }
}

impl FromStr for AgentSecret {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let priv_key: [u8; 32] = hex::decode(s)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("failed to parse: invalid key length"))?;
        Ok(SigningKey::from_bytes(&priv_key).into())
    }
}

/// The verifying half of an agent identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(VerifyingKey);

impl AgentId {
    /// Verify a signature made by this agent.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0.verify_strict(msg, signature)
    }

    /// The public key byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Construct from the 32 public key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> anyhow::Result<Self> {
        Ok(AgentId(VerifyingKey::from_bytes(bytes)?))
    }

    /// Shortened hex form for logging.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0.as_bytes()[..4])
    }
}

impl PartialOrd for AgentId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AgentId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.as_bytes()))
    }
}

impl Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", self.fmt_short())
    }
}

impl FromStr for AgentId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pub_key: [u8; 32] = hex::decode(s)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("failed to parse: invalid key length"))?;
        Self::from_bytes(&pub_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_roundtrip() -> anyhow::Result<()> {
        let mut rng = rand::thread_rng();
        let agent = AgentSecret::new(&mut rng);
        let id = agent.id();

        let sig = agent.sign(b"hello");
        id.verify(b"hello", &sig)?;
        assert!(id.verify(b"tampered", &sig).is_err());

        let parsed: AgentId = id.to_string().parse()?;
        assert_eq!(parsed, id);
        Ok(())
    }

    #[test]
    fn hash_display() {
        let hash = Hash::new(b"some data");
        assert_eq!(hash, Hash::new(b"some data"));
        assert_ne!(hash, Hash::new(b"other data"));
        assert_eq!(hash.fmt_short().len(), 8);
        assert!(hash.to_string().starts_with(&hash.fmt_short()));
    }
}
