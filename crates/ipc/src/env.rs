// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child environment contract.
//!
//! The parent injects identity and endpoint variables at spawn; the embedded
//! protocol client reads them back with [`ChildEnv::from_env`].

use crate::endpoint::Endpoint;
use crate::frame::FrameIdent;
use serde_json::Value;
use thiserror::Error;

pub const ENV_JOB_ID: &str = "DONKEYLABS_JOB_ID";
pub const ENV_PROCESS_ID: &str = "DONKEYLABS_PROCESS_ID";
pub const ENV_SOCKET_PATH: &str = "DONKEYLABS_SOCKET_PATH";
pub const ENV_TCP_PORT: &str = "DONKEYLABS_TCP_PORT";
pub const ENV_METADATA: &str = "DONKEYLABS_METADATA";
pub const ENV_JOB_NAME: &str = "DONKEYLABS_JOB_NAME";

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("neither {ENV_JOB_ID} nor {ENV_PROCESS_ID} is set")]
    MissingIdentity,

    #[error("neither {ENV_SOCKET_PATH} nor {ENV_TCP_PORT} is set")]
    MissingEndpoint,

    #[error("invalid {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

/// Identity and endpoint a spawned child reads from its environment.
#[derive(Debug, Clone)]
pub struct ChildEnv {
    pub ident: FrameIdent,
    pub endpoint: Endpoint,
    /// Opaque map passed through at spawn, if any.
    pub metadata: Option<Value>,
    /// Registered handler name (jobs only).
    pub job_name: Option<String>,
}

impl ChildEnv {
    /// Read the contract from the process environment.
    pub fn from_env() -> Result<Self, EnvError> {
        let ident = if let Ok(id) = std::env::var(ENV_JOB_ID) {
            FrameIdent::job(id)
        } else if let Ok(id) = std::env::var(ENV_PROCESS_ID) {
            FrameIdent::process(id)
        } else {
            return Err(EnvError::MissingIdentity);
        };

        let endpoint = if let Ok(path) = std::env::var(ENV_SOCKET_PATH) {
            Endpoint::Unix(path.into())
        } else if let Ok(port) = std::env::var(ENV_TCP_PORT) {
            let port = port.parse::<u16>().map_err(|e| EnvError::Invalid {
                name: ENV_TCP_PORT,
                message: e.to_string(),
            })?;
            Endpoint::Tcp(port)
        } else {
            return Err(EnvError::MissingEndpoint);
        };

        let metadata = match std::env::var(ENV_METADATA) {
            Ok(raw) => Some(serde_json::from_str(&raw).map_err(|e| EnvError::Invalid {
                name: ENV_METADATA,
                message: e.to_string(),
            })?),
            Err(_) => None,
        };

        Ok(Self {
            ident,
            endpoint,
            metadata,
            job_name: std::env::var(ENV_JOB_NAME).ok(),
        })
    }

    /// The variables the parent injects for this contract. The inverse of
    /// [`ChildEnv::from_env`].
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        match &self.ident {
            FrameIdent::Job { job_id } => vars.push((ENV_JOB_ID.into(), job_id.clone())),
            FrameIdent::Process { process_id } => {
                vars.push((ENV_PROCESS_ID.into(), process_id.clone()))
            }
            // Isolated workflow executors get their identity over stdin,
            // not the environment.
            FrameIdent::Instance { .. } => {}
        }
        match &self.endpoint {
            Endpoint::Unix(path) => {
                vars.push((ENV_SOCKET_PATH.into(), path.to_string_lossy().into_owned()))
            }
            Endpoint::Tcp(port) => vars.push((ENV_TCP_PORT.into(), port.to_string())),
        }
        if let Some(ref metadata) = self.metadata {
            vars.push((ENV_METADATA.into(), metadata.to_string()));
        }
        if let Some(ref name) = self.job_name {
            vars.push((ENV_JOB_NAME.into(), name.clone()));
        }
        vars
    }
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
