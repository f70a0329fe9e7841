use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

static DEFAULT_REGISTRY: &str = "index.docker.io";
static DOCKER_HUB_ALIASES: &[&str] = &[
    "index.docker.io",
    "docker.io",
    "registry-1.docker.io",
    "https://index.docker.io/v1/",
];

/// Wrapper for secrets loaded from the Docker config. Debug and Display print
/// a redacted placeholder so credentials never end up in logs.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: String) -> Self {
        SecretString(s)
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: SecretString,
}

/// Credentials parsed from a Docker `config.json`, keyed as in its `auths`
/// section. Built once at startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct DockerConfig {
    auths: BTreeMap<String, RegistryAuth>,
}

#[derive(Debug, Deserialize)]
struct RawDockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, RawAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct RawAuthEntry {
    username: Option<String>,
    password: Option<String>,
    auth: Option<String>,
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<DockerConfig> {
    info!("Loading Docker config from file {}", path.as_ref().display());
    let content = fs::read_to_string(&path).with_context(|| {
        format!(
            "Failed to read Docker config file: {}",
            path.as_ref().display()
        )
    })?;
    let raw: RawDockerConfig =
        serde_json::from_str(&content).context("Failed to parse Docker config JSON")?;

    let mut auths = BTreeMap::new();
    for (key, entry) in raw.auths {
        let auth = resolve_entry(&key, entry)?;
        auths.insert(key, auth);
    }
    Ok(DockerConfig { auths })
}

fn resolve_entry(key: &str, entry: RawAuthEntry) -> Result<RegistryAuth> {
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Ok(RegistryAuth {
            username: username.clone(),
            password: SecretString::new(password.clone()),
        });
    }

    // Packed form: base64("username:password")
    let Some(auth) = entry.auth else {
        bail!("Auth entry {} has neither username/password nor auth", key);
    };
    let decoded = STANDARD
        .decode(auth.as_bytes())
        .with_context(|| format!("Auth entry {} is not valid base64", key))?;
    let decoded = String::from_utf8(decoded)
        .with_context(|| format!("Auth entry {} is not valid UTF-8", key))?;
    let Some((username, password)) = decoded.split_once(':') else {
        bail!("Auth entry {} does not contain username:password", key);
    };
    Ok(RegistryAuth {
        username: username.to_string(),
        password: SecretString::new(password.to_string()),
    })
}

impl DockerConfig {
    /// Look up credentials by the literal key of the `auths` section.
    pub fn auth_for(&self, key: &str) -> Option<&RegistryAuth> {
        self.auths.get(key)
    }

    /// Look up credentials for a registry host, trying the Docker Hub aliases
    /// when the host is the canonical Hub registry.
    pub fn auth_for_host(&self, host: &str) -> Option<&RegistryAuth> {
        if let Some(auth) = self.auths.get(host) {
            return Some(auth);
        }
        if host == DEFAULT_REGISTRY {
            return DOCKER_HUB_ALIASES
                .iter()
                .find_map(|alias| self.auths.get(*alias));
        }
        None
    }
}
