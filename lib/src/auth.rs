//! Locates registry credentials.

use std::{collections::HashMap, path::PathBuf, process::Stdio};

use base64::Engine;
use color_eyre::{
    eyre::{eyre, Context, OptionExt, Result},
    Section, SectionExt,
};
use derive_more::Debug;
use oci_client::secrets::RegistryAuth;
use serde::Deserialize;
use tap::Pipe;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Credentials presented to the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Authentication {
    /// Anonymous access.
    #[default]
    None,

    /// Username and password.
    Basic {
        username: String,
        #[debug(skip)]
        password: String,
    },
}

impl Authentication {
    /// Create basic credentials.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Find credentials for the host in the Docker configuration.
    ///
    /// The configuration is read from `$DOCKER_CONFIG/config.json`, or `~/.docker/config.json`.
    /// Anything that goes wrong is logged and results in anonymous access.
    ///
    /// Reference:
    /// - https://docs.docker.com/reference/cli/docker/login
    /// - https://github.com/docker/docker-credential-helpers
    pub async fn docker(host: &str) -> Self {
        match Self::docker_internal(host).await {
            Ok(auth) => {
                debug!(host, ?auth, "inferred docker auth");
                auth
            }
            Err(err) => {
                warn!(host, ?err, "unable to infer docker auth; trying unauthenticated");
                Self::None
            }
        }
    }

    async fn docker_internal(host: &str) -> Result<Self> {
        let path = docker_config_path()?;
        Self::from_docker_config(&path, host).await
    }

    /// Read credentials for the host out of a specific Docker configuration file.
    pub async fn from_docker_config(path: &std::path::Path, host: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .context("read docker config")
            .with_section(|| path.display().to_string().header("Config file path:"))?;

        serde_json::from_str::<DockerConfig>(&content)
            .context("parse docker config")
            .with_section(|| path.display().to_string().header("Config file path:"))?
            .auth(host)
            .await
    }
}

impl From<&Authentication> for RegistryAuth {
    fn from(auth: &Authentication) -> Self {
        match auth {
            Authentication::None => RegistryAuth::Anonymous,
            Authentication::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
        }
    }
}

fn docker_config_path() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
        return Ok(PathBuf::from(dir).join("config.json"));
    }
    dirs::home_dir()
        .ok_or_eyre("get home directory")?
        .join(".docker")
        .join("config.json")
        .pipe(Ok)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    /// Default credential helper, named by the suffix after `docker-credential-`.
    creds_store: Option<String>,

    /// Credential helpers per host, named the same way as `creds_store`.
    #[serde(default)]
    cred_helpers: HashMap<String, String>,

    /// Logged in hosts.
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

impl DockerConfig {
    /// Keys under which a host's credentials may be stored.
    /// Docker Hub logins are historically recorded under the v1 index URL.
    fn auth_keys(host: &str) -> Vec<&str> {
        let mut keys = vec![host];
        if matches!(host, "docker.io" | "index.docker.io" | "registry-1.docker.io") {
            keys.push("https://index.docker.io/v1/");
        }
        keys
    }

    async fn auth(&self, host: &str) -> Result<Authentication> {
        for key in Self::auth_keys(host) {
            let Some(entry) = self.auths.get(key) else {
                continue;
            };
            match entry.auth.as_deref() {
                Some(encoded) => match decode_plain(encoded) {
                    Ok(auth) => return Ok(auth),
                    Err(err) => warn!(key, ?err, "decode stored auth"),
                },
                // An entry with no inline secret means a helper holds it.
                None => return self.helper(host).await,
            }
        }

        if self.cred_helpers.contains_key(host) || self.creds_store.is_some() {
            return self.helper(host).await;
        }

        Ok(Authentication::None)
    }

    async fn helper(&self, host: &str) -> Result<Authentication> {
        let helper = self
            .cred_helpers
            .get(host)
            .or(self.creds_store.as_ref())
            .ok_or_eyre("no helper found for host")?;

        let binary = format!("docker-credential-{helper}");
        let mut exec = tokio::process::Command::new(&binary)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn docker credential helper")
            .with_section(|| binary.clone().header("Helper binary:"))?;

        if let Some(mut stdin) = exec.stdin.take() {
            stdin
                .write_all(host.as_bytes())
                .await
                .context("write request to helper")?;
        }

        let output = exec.wait_with_output().await.context("run helper")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(eyre!("credential helper failed with status: {}", output.status))
                .with_section(|| binary.clone().header("Helper binary:"))
                .with_section(|| stderr.header("Stderr:"));
        }

        let credential = serde_json::from_slice::<DockerCredential>(&output.stdout)
            .context("decode helper output")
            .with_section(|| binary.header("Helper binary:"))?;
        Ok(Authentication::basic(credential.username, credential.secret))
    }
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    /// Base64 encoded `username:password`.
    auth: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerCredential {
    username: String,
    secret: String,
}

fn decode_plain(encoded: &str) -> Result<Authentication> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("decode base64 auth key")?;
    let decoded = String::from_utf8(decoded).context("parse auth key as utf-8")?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_eyre("invalid auth key format, expected username:password")?;
    Ok(Authentication::basic(username, password))
}
