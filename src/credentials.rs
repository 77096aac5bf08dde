//! On-disk credential artifacts for registered targets.
//!
//! Each target directory is produced by runner registration and holds three
//! files: `.runner` (broker base URL and agent identity), `.credentials`
//! (OAuth client ID and authorization endpoint) and `.credentials_rsaparams`
//! (the RSA private-key components used to sign client assertions).

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use crate::error::{ProxyError, Result};

/// Contents of the `.runner` file.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerFile {
    /// Upstream broker base URL for the V2 flow.
    #[serde(rename = "serverUrlV2")]
    pub server_url_v2: String,
    /// Registered agent ID.
    #[serde(default, rename = "agentId")]
    pub agent_id: u64,
    /// Registered agent name.
    #[serde(default, rename = "agentName")]
    pub agent_name: String,
}

/// OAuth client identity from the `.credentials` file.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthCredentials {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "authorizationUrl")]
    pub authorization_url: String,
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    data: OAuthCredentials,
}

/// Raw `.credentials_rsaparams` document (all fields standard base64).
#[derive(Debug, Deserialize)]
struct RsaParamsFile {
    d: String,
    p: String,
    q: String,
    dp: String,
    dq: String,
    #[serde(rename = "inverseQ")]
    inverse_q: String,
    modulus: String,
    exponent: String,
}

/// Decoded RSA private-key components, big-endian bytes.
#[derive(Clone)]
pub struct RsaParameters {
    pub d: Vec<u8>,
    pub p: Vec<u8>,
    pub q: Vec<u8>,
    pub dp: Vec<u8>,
    pub dq: Vec<u8>,
    pub inverse_q: Vec<u8>,
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
}

impl std::fmt::Debug for RsaParameters {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaParameters")
            .field("modulus_bits", &(self.modulus.len() * 8))
            .finish_non_exhaustive()
    }
}

impl RsaParameters {
    fn from_file(file: RsaParamsFile) -> Result<Self> {
        let decode = |name: &str, value: &str| -> Result<Vec<u8>> {
            BASE64.decode(value).map_err(|e| ProxyError::Credential {
                reason: format!("invalid base64 in RSA component {}: {}", name, e),
            })
        };

        Ok(Self {
            d: decode("d", &file.d)?,
            p: decode("p", &file.p)?,
            q: decode("q", &file.q)?,
            dp: decode("dp", &file.dp)?,
            dq: decode("dq", &file.dq)?,
            inverse_q: decode("inverseQ", &file.inverse_q)?,
            modulus: decode("modulus", &file.modulus)?,
            exponent: decode("exponent", &file.exponent)?,
        })
    }
}

/// A registered upstream target with all credential artifacts loaded.
#[derive(Debug, Clone)]
pub struct Target {
    /// Opaque stable identifier.
    pub id: String,
    /// Human-readable name for logs and status.
    pub display_name: String,
    /// Disabled targets keep their registration but get no session or polls.
    pub enabled: bool,
    pub runner: RunnerFile,
    pub oauth: OAuthCredentials,
    pub rsa: RsaParameters,
}

impl Target {
    /// Load a target from a credential directory.
    pub fn load(id: impl Into<String>, display_name: impl Into<String>, dir: &Path) -> Result<Self> {
        let runner: RunnerFile = read_json(&dir.join(".runner"))?;
        let creds: CredentialsFile = read_json(&dir.join(".credentials"))?;
        let rsa_file: RsaParamsFile = read_json(&dir.join(".credentials_rsaparams"))?;

        Ok(Self {
            id: id.into(),
            display_name: display_name.into(),
            enabled: true,
            runner,
            oauth: creds.data,
            rsa: RsaParameters::from_file(rsa_file)?,
        })
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|e| ProxyError::Credential {
        reason: format!("cannot read {}: {}", path.display(), e),
    })?;
    serde_json::from_str(&text).map_err(|e| ProxyError::Credential {
        reason: format!("cannot parse {}: {}", path.display(), e),
    })
}
