//! Production signer: schnorr signatures and peer-addressed content
//! encryption over an ECDH shared secret (AES-256-CBC, `ciphertext?iv=...`
//! envelope, both parts base64).
//!
//! The seed is accepted as 64-char hex or a bech32 `nsec` envelope.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use secp256k1::schnorr::Signature;
use secp256k1::{All, Keypair, Message, Parity, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use std::str::FromStr;
use zg_protocol::{Event, EventTemplate, Signer, SignerError, event_id};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub struct KeySigner {
    secp: Secp256k1<All>,
    keypair: Keypair,
    public_key: String,
}

impl KeySigner {
    /// Build from the configured seed: 64-char hex or bech32 `nsec...`.
    pub fn from_encoded(encoded: &str) -> Result<Self, SignerError> {
        let trimmed = encoded.trim();
        let bytes = if trimmed.starts_with("nsec") {
            let (hrp, data) = bech32::decode(trimmed)
                .map_err(|e| SignerError::Key(format!("bech32: {e}")))?;
            if hrp.as_str() != "nsec" {
                return Err(SignerError::Key(format!(
                    "expected nsec envelope, got '{}'",
                    hrp.as_str()
                )));
            }
            data
        } else {
            hex::decode(trimmed).map_err(|e| SignerError::Key(format!("hex: {e}")))?
        };
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignerError::Key("seed must be exactly 32 bytes".to_owned()))?;
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, SignerError> {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(seed)
            .map_err(|e| SignerError::Key(format!("secret key: {e}")))?;
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let (xonly, _parity) = XOnlyPublicKey::from_keypair(&keypair);
        Ok(Self {
            secp,
            keypair,
            public_key: xonly.to_string(),
        })
    }

    /// ECDH shared secret with `peer`: the x coordinate of the shared point.
    fn shared_key(&self, peer_pubkey: &str) -> Result<[u8; 32], SignerError> {
        let xonly = XOnlyPublicKey::from_str(peer_pubkey)
            .map_err(|e| SignerError::Key(format!("peer key '{peer_pubkey}': {e}")))?;
        let full = PublicKey::from_x_only_public_key(xonly, Parity::Even);
        let point = secp256k1::ecdh::shared_secret_point(&full, &self.keypair.secret_key());
        let mut key = [0u8; 32];
        key.copy_from_slice(&point[..32]);
        Ok(key)
    }
}

impl Signer for KeySigner {
    fn public_key(&self) -> String {
        self.public_key.clone()
    }

    fn sign(&self, template: EventTemplate) -> Result<Event, SignerError> {
        let pubkey = self.public_key.clone();
        let id = event_id(
            &pubkey,
            template.created_at,
            template.kind,
            &template.tags,
            &template.content,
        );
        let digest: [u8; 32] = hex::decode(&id)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| SignerError::Sign("event id is not a 32-byte hash".to_owned()))?;
        let sig = self
            .secp
            .sign_schnorr(&Message::from_digest(digest), &self.keypair);
        Ok(Event {
            id,
            pubkey,
            created_at: template.created_at,
            kind: template.kind,
            tags: template.tags,
            content: template.content,
            sig: sig.to_string(),
        })
    }

    fn encrypt(&self, peer_pubkey: &str, plaintext: &str) -> Result<String, SignerError> {
        let key = self.shared_key(peer_pubkey)?;
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);
        let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|e| SignerError::Encrypt(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        Ok(format!(
            "{}?iv={}",
            BASE64.encode(ciphertext),
            BASE64.encode(iv)
        ))
    }

    fn decrypt(&self, peer_pubkey: &str, ciphertext: &str) -> Result<String, SignerError> {
        let (ct_b64, iv_b64) = ciphertext
            .split_once("?iv=")
            .ok_or_else(|| SignerError::Decrypt("missing iv separator".to_owned()))?;
        let ct = BASE64
            .decode(ct_b64)
            .map_err(|e| SignerError::Decrypt(format!("ciphertext base64: {e}")))?;
        let iv = BASE64
            .decode(iv_b64)
            .map_err(|e| SignerError::Decrypt(format!("iv base64: {e}")))?;
        let key = self.shared_key(peer_pubkey)?;
        let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
            .map_err(|e| SignerError::Decrypt(e.to_string()))?;
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ct)
            .map_err(|e| SignerError::Decrypt(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| SignerError::Decrypt(e.to_string()))
    }

    fn verify(&self, event: &Event) -> bool {
        if !event.verify_id() {
            return false;
        }
        let Ok(xonly) = XOnlyPublicKey::from_str(&event.pubkey) else {
            return false;
        };
        let Ok(sig) = Signature::from_str(&event.sig) else {
            return false;
        };
        let Some(digest) = hex::decode(&event.id)
            .ok()
            .and_then(|v| <[u8; 32]>::try_from(v).ok())
        else {
            return false;
        };
        self.secp
            .verify_schnorr(&sig, &Message::from_digest(digest), &xonly)
            .is_ok()
    }
}
