use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub webserver: Webserver,
    pub backup: Backup,
    #[serde(default = "default_ignore_namespaces", rename = "ignoreNamespaces")]
    pub ignore_namespaces: Vec<String>,
    #[serde(rename = "dockerConfig")]
    pub docker_config: DockerConfigSource,
}

#[derive(Debug, Deserialize)]
pub struct Backup {
    /// Registry root every mirrored image lands under
    pub registry: String,
}

#[derive(Debug, Deserialize)]
pub struct DockerConfigSource {
    pub path: PathBuf,
    /// Entry of the `auths` section holding the backup registry credentials
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

fn default_ignore_namespaces() -> Vec<String> {
    vec!["kube-system".to_string(), "local-path-storage".to_string()]
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error if any env var is missing or regex fails.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| panic!("Missing environment variable: {}", var_name))
    });

    Ok(result.into_owned())
}
