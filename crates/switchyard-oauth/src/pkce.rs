use base64::Engine;
use rand::RngCore;
use sha2::Digest;

#[derive(Debug, Clone)]
pub struct PkceCodes {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl PkceCodes {
    /// Fresh verifier/challenge pair (S256) plus a request state nonce.
    pub fn generate() -> Self {
        let verifier = random_urlsafe();
        let mut hasher = sha2::Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize());
        Self {
            verifier,
            challenge,
            state: random_urlsafe(),
        }
    }
}

fn random_urlsafe() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
