use std::hash::Hasher;

use rand::Rng;
use rustc_hash::FxHasher;

use crate::shared::ConnectionId;
use crate::token::ResetToken;
use crate::RESET_TOKEN_SIZE;

/// Plaintext descriptor protected inside a locally issued CID
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CidPlaintext {
    /// Identifies the connection within the issuing endpoint
    pub master_id: u64,
    /// Identifies one CID among all issued for the connection; always equal to the CID's
    /// sequence number
    pub path_id: u64,
}

/// Converts plaintext CID descriptors into wire-visible bytes and back
///
/// Connection IDs MUST NOT contain any information that can be used by
/// an external observer (that is, one that does not cooperate with the
/// issuer) to correlate them with other connection IDs for the same
/// connection.
///
/// Implementations are pure: no call ordering is assumed, and a descriptor may be encrypted any
/// number of times. `decrypt_cid` is the inverse of `encrypt_cid` and is used by receive-side
/// validation, not by the issued-CID state machine itself.
pub trait CidEncryptor: Send + Sync {
    /// Compute the wire bytes and stateless reset token for `plaintext`
    fn encrypt_cid(&self, plaintext: &CidPlaintext) -> (ConnectionId, ResetToken);
    /// Recover the descriptor encrypted into `encrypted`, if it authenticates
    fn decrypt_cid(&self, encrypted: &[u8]) -> Option<CidPlaintext>;
}

/// Length of the descriptor body carried in an encoded CID
const BODY_LEN: usize = 16;
/// Length of the keyed tag appended to the body
const TAG_LEN: usize = 4;
/// Domain separator so reset tokens never share key stream with CID bodies
const TOKEN_TWEAK: u64 = 0x746f6b656e;

/// Encrypts CID descriptors under a 64-bit key using a keyed hash
///
/// This uses a non-cryptographic hash and can therefore still be spoofed, but nonetheless lets an
/// endpoint recognize its own CIDs and discard forgeries at very low cost. `decrypt_cid` rejects
/// bytes whose tag does not verify under the key.
pub struct HashedCidEncryptor {
    key: u64,
}

impl HashedCidEncryptor {
    /// Create an encryptor with a random key
    pub fn new() -> Self {
        Self::from_key(rand::thread_rng().gen())
    }

    /// Create an encryptor with a specific key
    ///
    /// Allows CIDs issued by a previous instance of this endpoint to remain recognizable across
    /// restarts
    pub fn from_key(key: u64) -> Self {
        Self { key }
    }

    /// Key stream the descriptor body is masked with
    fn mask(&self) -> [u8; BODY_LEN] {
        let mut hasher = FxHasher::default();
        hasher.write_u64(self.key);
        let lo = hasher.finish();
        hasher.write_u64(lo);
        let hi = hasher.finish();
        let mut mask = [0; BODY_LEN];
        mask[..8].copy_from_slice(&lo.to_le_bytes());
        mask[8..].copy_from_slice(&hi.to_le_bytes());
        mask
    }

    /// Authentication tag over the masked body
    fn tag(&self, body: &[u8]) -> [u8; TAG_LEN] {
        let mut hasher = FxHasher::default();
        hasher.write_u64(self.key);
        hasher.write(body);
        let mut tag = [0; TAG_LEN];
        tag.copy_from_slice(&hasher.finish().to_le_bytes()[..TAG_LEN]);
        tag
    }

    fn reset_token(&self, cid: &ConnectionId) -> ResetToken {
        let mut hasher = FxHasher::default();
        hasher.write_u64(self.key ^ TOKEN_TWEAK);
        hasher.write(cid);
        let lo = hasher.finish();
        hasher.write_u64(lo);
        let hi = hasher.finish();
        let mut token = [0; RESET_TOKEN_SIZE];
        token[..8].copy_from_slice(&lo.to_le_bytes());
        token[8..].copy_from_slice(&hi.to_le_bytes());
        token.into()
    }
}

impl Default for HashedCidEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl CidEncryptor for HashedCidEncryptor {
    fn encrypt_cid(&self, plaintext: &CidPlaintext) -> (ConnectionId, ResetToken) {
        let mut bytes = [0; BODY_LEN + TAG_LEN];
        bytes[..8].copy_from_slice(&plaintext.master_id.to_le_bytes());
        bytes[8..BODY_LEN].copy_from_slice(&plaintext.path_id.to_le_bytes());
        for (byte, mask) in bytes[..BODY_LEN].iter_mut().zip(self.mask()) {
            *byte ^= mask;
        }
        let tag = self.tag(&bytes[..BODY_LEN]);
        bytes[BODY_LEN..].copy_from_slice(&tag);
        let cid = ConnectionId::new(&bytes);
        let reset_token = self.reset_token(&cid);
        (cid, reset_token)
    }

    fn decrypt_cid(&self, encrypted: &[u8]) -> Option<CidPlaintext> {
        if encrypted.len() != BODY_LEN + TAG_LEN {
            return None;
        }
        if self.tag(&encrypted[..BODY_LEN])[..] != encrypted[BODY_LEN..] {
            return None;
        }
        let mut body = [0; BODY_LEN];
        body.copy_from_slice(&encrypted[..BODY_LEN]);
        for (byte, mask) in body.iter_mut().zip(self.mask()) {
            *byte ^= mask;
        }
        Some(CidPlaintext {
            master_id: u64::from_le_bytes(body[..8].try_into().unwrap()),
            path_id: u64::from_le_bytes(body[8..].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let encryptor = HashedCidEncryptor::from_key(0x1234_5678);
        let plaintext = CidPlaintext {
            master_id: 42,
            path_id: 7,
        };
        let (cid, _token) = encryptor.encrypt_cid(&plaintext);
        assert_eq!(encryptor.decrypt_cid(&cid), Some(plaintext));
    }

    #[test]
    fn rejects_forgeries() {
        let encryptor = HashedCidEncryptor::from_key(0x1234_5678);
        let (cid, _) = encryptor.encrypt_cid(&CidPlaintext {
            master_id: 42,
            path_id: 7,
        });

        let mut tampered = cid.to_vec();
        tampered[0] ^= 0xff;
        assert_eq!(encryptor.decrypt_cid(&tampered), None);
        assert_eq!(encryptor.decrypt_cid(&cid[..10]), None);

        // A CID from one key must not authenticate under another
        let other = HashedCidEncryptor::from_key(0x8765_4321);
        assert_eq!(other.decrypt_cid(&cid), None);
    }

    #[test]
    fn tokens_are_keyed() {
        let plaintext = CidPlaintext {
            master_id: 42,
            path_id: 7,
        };
        let (_, first) = HashedCidEncryptor::from_key(1).encrypt_cid(&plaintext);
        let (_, second) = HashedCidEncryptor::from_key(2).encrypt_cid(&plaintext);
        assert_ne!(first, second);
    }
}
