//! SCRAM-SHA-256 client authentication (RFC 5802, RFC 7677).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Client side of one SCRAM-SHA-256 exchange.
pub struct ScramFlow {
    username: String,
    password: String,
    client_nonce: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramFlow {
    pub fn new(username: &str, password: &str) -> ScramFlow {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        ScramFlow {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: BASE64.encode(nonce_bytes),
            auth_message: None,
            salted_password: None,
        }
    }

    fn client_first_bare(&self) -> String {
        // GS2 header "n,," is prepended separately; PostgreSQL ignores the
        // SASLprep subtleties for the common case.
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// client-first-message.
    pub fn first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume server-first-message, produce client-final-message.
    pub fn continue_with(&mut self, server_first: &[u8]) -> Result<Vec<u8>, String> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| "server-first-message is not UTF-8".to_string())?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            if let Some(v) = attr.strip_prefix("r=") {
                nonce = Some(v.to_string());
            } else if let Some(v) = attr.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(v)
                        .map_err(|_| "invalid salt encoding".to_string())?,
                );
            } else if let Some(v) = attr.strip_prefix("i=") {
                iterations = Some(
                    v.parse::<u32>()
                        .map_err(|_| "invalid iteration count".to_string())?,
                );
            }
        }
        let nonce = nonce.ok_or_else(|| "missing server nonce".to_string())?;
        let salt = salt.ok_or_else(|| "missing salt".to_string())?;
        let iterations = iterations.ok_or_else(|| "missing iteration count".to_string())?;

        if !nonce.starts_with(&self.client_nonce) {
            return Err("server nonce does not extend the client nonce".to_string());
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());

        let mut proof = [0u8; 32];
        for i in 0..32 {
            proof[i] = client_key[i] ^ client_signature[i];
        }

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Verify server-final-message.
    pub fn finish(&self, server_final: &[u8]) -> Result<(), String> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| "server-final-message is not UTF-8".to_string())?;
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or_else(|| "missing server signature".to_string())?;
        let signature = BASE64
            .decode(verifier)
            .map_err(|_| "invalid server signature encoding".to_string())?;

        let salted_password = self
            .salted_password
            .ok_or_else(|| "handshake out of order".to_string())?;
        let auth_message = self
            .auth_message
            .as_ref()
            .ok_or_else(|| "handshake out of order".to_string())?;

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());
        if signature != expected {
            return Err("server signature verification failed".to_string());
        }
        Ok(())
    }
}

fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut out)
        .expect("valid output length");
    out
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
