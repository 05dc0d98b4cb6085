//! Bearer-token verification against a single JSON Web Key.
//!
//! The key is parsed once at configuration time; a malformed key fails the
//! whole configuration load.

use jsonwebtoken::jwk::{Jwk, KeyAlgorithm};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::fmt;
use thiserror::Error;

/// Errors produced while loading a key or verifying a token.
#[derive(Error, Debug)]
pub enum JwtError {
    /// The configured key is not a valid JWK.
    #[error("key is not a valid JWK: {0}")]
    InvalidKey(String),

    /// The key does not declare a supported signature algorithm.
    #[error("unsupported JWK algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The presented token failed validation.
    #[error("JWT is not valid: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

/// Verifier for compact JWS tokens signed with a single key.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}

impl JwtVerifier {
    /// Parses a JWK from its JSON representation and retains a decoding key.
    pub fn new(jwk_json: &str) -> Result<Self, JwtError> {
        let jwk: Jwk =
            serde_json::from_str(jwk_json).map_err(|e| JwtError::InvalidKey(e.to_string()))?;
        let key = DecodingKey::from_jwk(&jwk).map_err(|e| JwtError::InvalidKey(e.to_string()))?;

        let alg = match jwk.common.key_algorithm {
            Some(a) => signature_algorithm(a)?,
            None => return Err(JwtError::UnsupportedAlgorithm("missing alg".to_string())),
        };

        let mut validation = Validation::new(alg);
        // exp and nbf are enforced when present but tokens without them are
        // accepted.
        validation.required_spec_claims.clear();
        validation.validate_nbf = true;

        Ok(Self { key, validation })
    }

    /// Verifies the signature and standard validity claims of a token.
    pub fn verify(&self, token: &str) -> Result<(), JwtError> {
        decode::<serde_json::Value>(token, &self.key, &self.validation)?;
        Ok(())
    }
}

fn signature_algorithm(alg: KeyAlgorithm) -> Result<Algorithm, JwtError> {
    match alg {
        KeyAlgorithm::HS256 => Ok(Algorithm::HS256),
        KeyAlgorithm::HS384 => Ok(Algorithm::HS384),
        KeyAlgorithm::HS512 => Ok(Algorithm::HS512),
        KeyAlgorithm::RS256 => Ok(Algorithm::RS256),
        KeyAlgorithm::RS384 => Ok(Algorithm::RS384),
        KeyAlgorithm::RS512 => Ok(Algorithm::RS512),
        KeyAlgorithm::PS256 => Ok(Algorithm::PS256),
        KeyAlgorithm::PS384 => Ok(Algorithm::PS384),
        KeyAlgorithm::PS512 => Ok(Algorithm::PS512),
        KeyAlgorithm::ES256 => Ok(Algorithm::ES256),
        KeyAlgorithm::ES384 => Ok(Algorithm::ES384),
        KeyAlgorithm::EdDSA => Ok(Algorithm::EdDSA),
        other => Err(JwtError::UnsupportedAlgorithm(format!("{other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const KEY_VALID: &str = "{\"use\":\"sign\",\"kty\":\"oct\",\"kid\":\"005456ff-1262-4bf0-a608-8534e1fe2763\",\"alg\":\"HS256\",\"k\":\"L0FCL4hivd7ShePdJnzEEoqlwoOfCrkcqdbXdADNk0s523xV7C5Sr6GiRIMpvNIelEsR6ta7MZnELY4JoHrm_w\"}";
    const TOKEN_INVALID: &str =
        "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9.e30.piBniOUxc9Mf51x9KrOhN1ZYfkmiNCsHBIRLDShjD2M";
    const TOKEN_VALID: &str =
        "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9.e30.TucQsITYiBvDjkOC4zk4Uj-hug6_usC_OjAuheinuUw";

    #[test]
    fn test_invalid_key_rejected() {
        assert!(JwtVerifier::new("{}").is_err());
        assert!(JwtVerifier::new("not json").is_err());
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let verifier = JwtVerifier::new(KEY_VALID).unwrap();
        assert!(verifier.verify(TOKEN_INVALID).is_err());
    }

    #[test]
    fn test_valid_token_accepted() {
        let verifier = JwtVerifier::new(KEY_VALID).unwrap();
        verifier.verify(TOKEN_VALID).unwrap();
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwk: serde_json::Value = serde_json::from_str(KEY_VALID).unwrap();
        let secret = URL_SAFE_NO_PAD
            .decode(jwk["k"].as_str().unwrap())
            .unwrap();
        let claims = serde_json::json!({ "exp": 1 });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&secret),
        )
        .unwrap();

        let verifier = JwtVerifier::new(KEY_VALID).unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let verifier = JwtVerifier::new(KEY_VALID).unwrap();
        assert!(verifier.verify("not-a-token").is_err());
    }
}
