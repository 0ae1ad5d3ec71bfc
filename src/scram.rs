//! SCRAM-SHA-256 client-side exchange (RFC 5802 / RFC 7677).

use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// SCRAM-SHA-256 client state, carried across the three messages of the exchange.
pub struct ScramClient {
    nonce: String,
    channel_binding: String,
    password: String,
    auth_message: Option<String>,
    salted_password: Option<Vec<u8>>,
}

impl ScramClient {
    /// Create a new SCRAM client with no channel binding (`n,,`).
    pub fn new(password: &str) -> Self {
        let mut nonce_bytes = [0u8; 24];
        rand::rng().fill(&mut nonce_bytes);
        let nonce = base64::engine::general_purpose::STANDARD.encode(nonce_bytes);

        Self {
            nonce,
            channel_binding: "n,,".to_string(),
            password: password.to_string(),
            auth_message: None,
            salted_password: None,
        }
    }

    /// Generate the client-first-message sent as the SASL initial response.
    pub fn client_first_message(&self) -> String {
        // Username is left empty; PostgreSQL ignores it and uses the startup
        // message's `user` parameter instead.
        format!("{}n=,r={}", self.channel_binding, self.nonce)
    }

    fn client_first_message_bare(&self) -> String {
        format!("n=,r={}", self.nonce)
    }

    /// Process the server-first-message and produce the client-final-message.
    pub fn process_server_first(&mut self, server_first: &str) -> Result<String> {
        let violation = |msg: &str| Error::ScramSHA256MechanismViolated(msg.to_string());

        let mut combined_nonce = None;
        let mut salt_b64 = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                combined_nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt_b64 = Some(value);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = value.parse().ok();
            }
        }

        let combined_nonce =
            combined_nonce.ok_or_else(|| violation("missing nonce in server-first-message"))?;
        let salt_b64 =
            salt_b64.ok_or_else(|| violation("missing salt in server-first-message"))?;
        let iterations: u32 =
            iterations.ok_or_else(|| violation("missing iteration count in server-first-message"))?;

        if !combined_nonce.starts_with(&self.nonce) {
            return Err(violation("server nonce does not extend client nonce"));
        }

        let salt = base64::engine::general_purpose::STANDARD
            .decode(salt_b64)
            .map_err(|e| violation(&format!("invalid salt encoding: {e}")))?;

        let mut salted_password = vec![0u8; 32];
        pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );
        self.salted_password = Some(salted_password.clone());

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&salted_password)
            .map_err(|e| violation(&format!("HMAC key error: {e}")))?;
        mac.update(b"Client Key");
        let client_key = mac.finalize().into_bytes();

        let stored_key = Sha256::digest(client_key);

        let channel_binding_b64 =
            base64::engine::general_purpose::STANDARD.encode(self.channel_binding.as_bytes());
        let client_final_without_proof = format!("c={},r={}", channel_binding_b64, combined_nonce);

        let auth_message = format!(
            "{},{},{}",
            self.client_first_message_bare(),
            server_first,
            client_final_without_proof
        );
        self.auth_message = Some(auth_message.clone());

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&stored_key)
            .map_err(|e| violation(&format!("HMAC key error: {e}")))?;
        mac.update(auth_message.as_bytes());
        let client_signature = mac.finalize().into_bytes();

        let mut client_proof = [0u8; 32];
        for (i, proof_byte) in client_proof.iter_mut().enumerate() {
            *proof_byte = client_key[i] ^ client_signature[i];
        }
        let proof_b64 = base64::engine::general_purpose::STANDARD.encode(client_proof);

        Ok(format!("{client_final_without_proof},p={proof_b64}"))
    }

    /// Verify the server-final-message's signature against the saved auth message.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        let server_signature_b64 = server_final.strip_prefix("v=").ok_or_else(|| {
            Error::ScramSHA256MechanismViolated("malformed server-final-message".to_string())
        })?;

        let server_signature = base64::engine::general_purpose::STANDARD
            .decode(server_signature_b64)
            .map_err(|e| {
                Error::ScramSHA256MechanismViolated(format!("invalid server signature encoding: {e}"))
            })?;

        let salted_password = self.salted_password.as_ref().ok_or_else(|| {
            Error::ScramSHA256MechanismViolated("server-final arrived before server-first".to_string())
        })?;
        let auth_message = self.auth_message.as_ref().ok_or_else(|| {
            Error::ScramSHA256MechanismViolated("server-final arrived before server-first".to_string())
        })?;

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(salted_password).map_err(|e| {
            Error::ScramSHA256MechanismViolated(format!("HMAC key error: {e}"))
        })?;
        mac.update(b"Server Key");
        let server_key = mac.finalize().into_bytes();

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&server_key).map_err(|e| {
            Error::ScramSHA256MechanismViolated(format!("HMAC key error: {e}"))
        })?;
        mac.update(auth_message.as_bytes());
        let expected_signature = mac.finalize().into_bytes();

        if server_signature.as_slice() != expected_signature.as_slice() {
            return Err(Error::ScramSHA256ServerVerificationFailed);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_first_message_has_no_channel_binding_by_default() {
        let client = ScramClient::new("secret");
        let msg = client.client_first_message();
        assert!(msg.starts_with("n,,n=,r="));
    }

    #[test]
    fn process_server_first_rejects_mismatched_nonce() {
        let mut client = ScramClient::new("secret");
        let err = client
            .process_server_first("r=not-the-client-nonce,s=AAAA,i=4096")
            .unwrap_err();
        assert!(matches!(err, Error::ScramSHA256MechanismViolated(_)));
    }

    #[test]
    fn process_server_first_produces_a_well_formed_client_final_message() {
        let mut client = ScramClient {
            nonce: "rOprNGfwEbeRWgbNEkqO".to_string(),
            channel_binding: "n,,".to_string(),
            password: "pencil".to_string(),
            auth_message: None,
            salted_password: None,
        };

        let server_first = "r=rOprNGfwEbeRWgbNEkqOserver-extension,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let client_final = client.process_server_first(server_first).unwrap();
        assert!(client_final.starts_with("c=biws,r=rOprNGfwEbeRWgbNEkqOserver-extension"));
        assert!(client_final.contains(",p="));
        assert!(client.salted_password.is_some());
    }

    #[test]
    fn full_exchange_matches_independently_derived_proof_and_signature() {
        let client_nonce = "rOprNGfwEbeRWgbNEkqO";
        let server_nonce = "%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0";
        let salt_b64 = "QSXCR+Q6sek8bf92";
        let iterations: u32 = 4096;
        let password = "pencil";

        let mut client = ScramClient {
            nonce: client_nonce.to_string(),
            channel_binding: "n,,".to_string(),
            password: password.to_string(),
            auth_message: None,
            salted_password: None,
        };

        let combined_nonce = format!("{client_nonce}{server_nonce}");
        let server_first = format!("r={combined_nonce},s={salt_b64},i={iterations}");
        let client_final = client.process_server_first(&server_first).unwrap();

        // Re-derive SaltedPassword/ClientKey/ClientSignature/ClientProof from
        // the RFC 5802 inputs directly, independent of `ScramClient`'s own
        // bookkeeping, and check they agree with what it produced.
        let salt = base64::engine::general_purpose::STANDARD
            .decode(salt_b64)
            .unwrap();
        let mut salted_password = [0u8; 32];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut salted_password);

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&salted_password).unwrap();
        mac.update(b"Client Key");
        let client_key = mac.finalize().into_bytes();
        let stored_key = Sha256::digest(client_key);

        let channel_binding_b64 = base64::engine::general_purpose::STANDARD.encode("n,,");
        let client_final_without_proof = format!("c={channel_binding_b64},r={combined_nonce}");
        let auth_message = format!(
            "n=,r={client_nonce},{server_first},{client_final_without_proof}"
        );

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&stored_key).unwrap();
        mac.update(auth_message.as_bytes());
        let client_signature = mac.finalize().into_bytes();

        let mut expected_proof = [0u8; 32];
        for (i, byte) in expected_proof.iter_mut().enumerate() {
            *byte = client_key[i] ^ client_signature[i];
        }
        let expected_proof_b64 = base64::engine::general_purpose::STANDARD.encode(expected_proof);
        let expected_client_final = format!("{client_final_without_proof},p={expected_proof_b64}");
        assert_eq!(client_final, expected_client_final);

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&salted_password).unwrap();
        mac.update(b"Server Key");
        let server_key = mac.finalize().into_bytes();
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&server_key).unwrap();
        mac.update(auth_message.as_bytes());
        let server_signature = mac.finalize().into_bytes();
        let server_final = format!(
            "v={}",
            base64::engine::general_purpose::STANDARD.encode(server_signature)
        );

        assert!(client.verify_server_final(&server_final).is_ok());
    }

    #[test]
    fn verify_server_final_rejects_wrong_signature() {
        let mut client = ScramClient {
            nonce: "rOprNGfwEbeRWgbNEkqO".to_string(),
            channel_binding: "n,,".to_string(),
            password: "pencil".to_string(),
            auth_message: None,
            salted_password: None,
        };
        let server_first = "r=rOprNGfwEbeRWgbNEkqOserver-extension,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        client.process_server_first(server_first).unwrap();

        let err = client
            .verify_server_final("v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert!(matches!(err, Error::ScramSHA256ServerVerificationFailed));
    }
}
