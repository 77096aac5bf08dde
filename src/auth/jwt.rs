//! Compact RS256 JWT assembly for the client-credentials flow.
//!
//! The signing key only exists on disk as raw CRT components, so the key is
//! rebuilt from those and the compact JWT is assembled by hand: base64url
//! header and claims, PKCS#1 v1.5 signature over the SHA-256 digest of the
//! signing input.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};

use crate::credentials::RsaParameters;
use crate::error::{ProxyError, Result};

/// Build an RSA private key from stored components.
///
/// Only `modulus`, `exponent`, `d`, `p` and `q` are needed; the CRT
/// accelerators are recomputed.
pub fn signing_key(params: &RsaParameters) -> Result<RsaPrivateKey> {
    let n = BigUint::from_bytes_be(&params.modulus);
    let e = BigUint::from_bytes_be(&params.exponent);
    let d = BigUint::from_bytes_be(&params.d);
    let primes = vec![
        BigUint::from_bytes_be(&params.p),
        BigUint::from_bytes_be(&params.q),
    ];

    RsaPrivateKey::from_components(n, e, d, primes).map_err(|e| ProxyError::Credential {
        reason: format!("invalid RSA parameters: {}", e),
    })
}

/// Mint a signed client-assertion JWT.
///
/// Claims follow the broker's client-credentials contract: `sub` and `iss`
/// are the client ID, `aud` is the authorization URL, and the token is valid
/// from `nbf = iat` to `exp = iat + lifetime`.
pub fn mint(
    params: &RsaParameters,
    client_id: &str,
    audience: &str,
    lifetime: Duration,
) -> Result<String> {
    let key = signing_key(params)?;

    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT"}"#);

    let now = chrono::Utc::now().timestamp();
    let claims = serde_json::json!({
        "sub": client_id,
        "iss": client_id,
        "aud": audience,
        "iat": now,
        "exp": now + lifetime.as_secs() as i64,
        "nbf": now,
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());

    let signing_input = format!("{}.{}", header, payload);
    let digest = Sha256::digest(signing_input.as_bytes());
    let signature = key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| ProxyError::Credential {
            reason: format!("JWT signing failed: {}", e),
        })?;

    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPublicKey;
    use rsa::traits::{PrivateKeyParts, PublicKeyParts};

    /// Decompose a generated key into the on-disk parameter shape.
    pub(crate) fn params_for_key(key: &RsaPrivateKey) -> RsaParameters {
        let primes = key.primes();
        RsaParameters {
            d: key.d().to_bytes_be(),
            p: primes[0].to_bytes_be(),
            q: primes[1].to_bytes_be(),
            dp: vec![],
            dq: vec![],
            inverse_q: vec![],
            modulus: key.n().to_bytes_be(),
            exponent: key.e().to_bytes_be(),
        }
    }

    pub(crate) fn generate_params() -> RsaParameters {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        params_for_key(&key)
    }

    #[test]
    fn test_jwt_round_trip() {
        let params = generate_params();
        let jwt = mint(
            &params,
            "client-42",
            "https://auth.example/token",
            Duration::from_secs(60),
        )
        .unwrap();

        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["typ"], "JWT");

        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims["sub"], "client-42");
        assert_eq!(claims["iss"], "client-42");
        assert_eq!(claims["aud"], "https://auth.example/token");
        let iat = claims["iat"].as_i64().unwrap();
        assert_eq!(claims["exp"].as_i64().unwrap(), iat + 60);
        assert_eq!(claims["nbf"].as_i64().unwrap(), iat);

        // Signature verifies against the public half of the same parameters.
        let key = signing_key(&params).unwrap();
        let public = RsaPublicKey::from(&key);
        let signing_input = format!("{}.{}", parts[0], parts[1]);
        let digest = Sha256::digest(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.decode(parts[2]).unwrap();
        public
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .unwrap();
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let params = generate_params();
        let jwt = mint(
            &params,
            "client-42",
            "https://auth.example/token",
            Duration::from_secs(60),
        )
        .unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();

        let forged = URL_SAFE_NO_PAD.encode(r#"{"sub":"someone-else"}"#);
        let key = signing_key(&params).unwrap();
        let public = RsaPublicKey::from(&key);
        let digest = Sha256::digest(format!("{}.{}", parts[0], forged).as_bytes());
        let signature = URL_SAFE_NO_PAD.decode(parts[2]).unwrap();
        assert!(
            public
                .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
                .is_err()
        );
    }

    #[test]
    fn test_garbage_parameters_rejected() {
        let params = RsaParameters {
            d: vec![1],
            p: vec![2],
            q: vec![3],
            dp: vec![],
            dq: vec![],
            inverse_q: vec![],
            modulus: vec![4],
            exponent: vec![5],
        };
        // A one-byte modulus cannot carry a PKCS#1 v1.5 SHA-256 signature.
        assert!(mint(&params, "c", "a", Duration::from_secs(60)).is_err());
    }
}
