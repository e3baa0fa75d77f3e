//! Daemon configuration synthesis.
//!
//! `cjdroute` produces a fresh configuration with `--genconf`; we normalize it
//! with `--cleanconf` (strips comments) and patch in what the session needs:
//! the node key, the bootstrap peer, the admin bind address and the tunnel
//! rendezvous socket.

use std::net::Ipv6Addr;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::Peer;
use crate::key::PrivateKey;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("failed to run {command}: {source}")]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("daemon config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon config is missing {0}")]
    MissingField(&'static str),

    #[error("daemon config has invalid address {0:?}")]
    Address(String),
}

/// Inputs for one synthesis.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisRequest<'a> {
    pub daemon: &'a str,
    pub rendezvous: &'a Path,
    pub admin_bind: &'a str,
    pub peer: &'a Peer,
    pub private_key: Option<&'a PrivateKey>,
}

/// A daemon configuration ready to be fed on stdin.
#[derive(Debug, Clone)]
pub struct Synthesized {
    pub config: String,
    pub address: Ipv6Addr,
    pub admin_password: String,
}

#[async_trait]
pub trait ConfigSynthesizer: Send + Sync {
    async fn synthesize(&self, request: SynthesisRequest<'_>) -> Result<Synthesized, SynthesisError>;
}

/// Generates configurations with the daemon binary itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct CjdrouteSynthesizer;

#[async_trait]
impl ConfigSynthesizer for CjdrouteSynthesizer {
    async fn synthesize(&self, request: SynthesisRequest<'_>) -> Result<Synthesized, SynthesisError> {
        let generated = run_daemon(request.daemon, &["--genconf", "--no-eth"], None).await?;
        let cleaned = run_daemon(request.daemon, &["--cleanconf"], Some(&generated)).await?;
        let mut config: Value = serde_json::from_slice(&cleaned)?;
        patch_config(&mut config, &request)
    }
}

async fn run_daemon(
    binary: &str,
    args: &[&str],
    input: Option<&[u8]>,
) -> Result<Vec<u8>, SynthesisError> {
    let command = format!("{binary} {}", args.join(" "));
    debug!("running {command}");
    let exec_err = |source| SynthesisError::Exec {
        command: command.clone(),
        source,
    };

    let mut child = Command::new(binary)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(exec_err)?;

    if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(bytes).await.map_err(exec_err)?;
    }

    let output = child.wait_with_output().await.map_err(exec_err)?;
    if !output.status.success() {
        return Err(SynthesisError::Failed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Apply the session's settings to a generated config and render it.
pub fn patch_config(
    config: &mut Value,
    request: &SynthesisRequest<'_>,
) -> Result<Synthesized, SynthesisError> {
    let root = config
        .as_object_mut()
        .ok_or(SynthesisError::MissingField("top-level object"))?;

    if let Some(key) = request.private_key {
        let public = key.public_key();
        root.insert("privateKey".into(), json!(key.to_hex()));
        root.insert("publicKey".into(), json!(public.to_string()));
        root.insert("ipv6".into(), json!(public.address().to_string()));
    }

    if !request.peer.address.is_empty() {
        if request.peer.public_key.is_empty() {
            warn!("peer {} has no public key", request.peer.address);
        }
        let connect_to = root
            .get_mut("interfaces")
            .and_then(|v| v.get_mut("UDPInterface"))
            .and_then(|v| v.get_mut(0))
            .and_then(|v| v.as_object_mut())
            .ok_or(SynthesisError::MissingField("interfaces.UDPInterface[0]"))?
            .entry("connectTo")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or(SynthesisError::MissingField("interfaces.UDPInterface[0].connectTo"))?;
        connect_to.insert(
            request.peer.address.clone(),
            json!({
                "password": request.peer.password,
                "publicKey": request.peer.public_key,
            }),
        );
    }

    let admin = root
        .get_mut("admin")
        .and_then(Value::as_object_mut)
        .ok_or(SynthesisError::MissingField("admin"))?;
    admin.insert("bind".into(), json!(request.admin_bind));
    let admin_password = admin
        .get("password")
        .and_then(Value::as_str)
        .ok_or(SynthesisError::MissingField("admin.password"))?
        .to_string();

    let router = root
        .get_mut("router")
        .and_then(Value::as_object_mut)
        .ok_or(SynthesisError::MissingField("router"))?;
    router.insert(
        "interface".into(),
        json!({
            "type": "TUNInterface",
            "tunfd": "normal",
            "tunDevice": request.rendezvous.to_string_lossy(),
        }),
    );

    let ipv6 = root
        .get("ipv6")
        .and_then(Value::as_str)
        .ok_or(SynthesisError::MissingField("ipv6"))?;
    let address = ipv6
        .parse()
        .map_err(|_| SynthesisError::Address(ipv6.to_string()))?;

    Ok(Synthesized {
        config: serde_json::to_string_pretty(config)?,
        address,
        admin_password,
    })
}
