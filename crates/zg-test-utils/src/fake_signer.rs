// A deterministic signer for tests.
//
// Signatures are keyed hashes over public data, so any FakeSigner can
// verify any other FakeSigner's events (mirroring real schnorr
// verification).  "Encryption" XORs against a secret derived from the
// unordered pair of public keys, which makes it symmetric between peers
// and produces the same `ciphertext?iv=...` envelope the production
// signer uses.  Nothing here is cryptography; it only has to round-trip.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha2::{Digest, Sha256};
use zg_protocol::{Event, EventTemplate, Signer, SignerError, event_id};

pub struct FakeSigner {
    public_key: String,
}

fn sha_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

fn fake_sig(pubkey: &str, id: &str) -> String {
    let first = sha_hex(&[b"zg-fake-sig-1:", pubkey.as_bytes(), id.as_bytes()]);
    let second = sha_hex(&[b"zg-fake-sig-2:", pubkey.as_bytes(), id.as_bytes()]);
    format!("{first}{second}")
}

fn pair_secret(a: &str, b: &str) -> Vec<u8> {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(b"zg-fake-shared:");
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    hasher.finalize().to_vec()
}

fn xor_stream(data: &[u8], key: &[u8]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, byte)| byte ^ key[i % key.len()])
        .collect()
}

impl FakeSigner {
    /// Derive a stable identity from a label ("alice", "gateway", ...).
    pub fn new(label: &str) -> Self {
        Self {
            public_key: sha_hex(&[b"zg-fake-key:", label.as_bytes()]),
        }
    }
}

impl Signer for FakeSigner {
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
        let sig = fake_sig(&pubkey, &id);
        Ok(Event {
            id,
            pubkey,
            created_at: template.created_at,
            kind: template.kind,
            tags: template.tags,
            content: template.content,
            sig,
        })
    }

    fn encrypt(&self, peer_pubkey: &str, plaintext: &str) -> Result<String, SignerError> {
        let key = pair_secret(&self.public_key, peer_pubkey);
        let ciphertext = xor_stream(plaintext.as_bytes(), &key);
        Ok(format!(
            "{}?iv={}",
            BASE64.encode(ciphertext),
            BASE64.encode(&key[..16])
        ))
    }

    fn decrypt(&self, peer_pubkey: &str, ciphertext: &str) -> Result<String, SignerError> {
        let (ct_b64, _iv) = ciphertext
            .split_once("?iv=")
            .ok_or_else(|| SignerError::Decrypt("missing iv separator".to_owned()))?;
        let ct = BASE64
            .decode(ct_b64)
            .map_err(|e| SignerError::Decrypt(e.to_string()))?;
        let key = pair_secret(&self.public_key, peer_pubkey);
        let plaintext = xor_stream(&ct, &key);
        String::from_utf8(plaintext).map_err(|e| SignerError::Decrypt(e.to_string()))
    }

    fn verify(&self, event: &Event) -> bool {
        event.verify_id() && event.sig == fake_sig(&event.pubkey, &event.id)
    }
}
