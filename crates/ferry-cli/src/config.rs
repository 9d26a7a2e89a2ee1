// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Ferry Contributors

//! Configuration for the connection tester.
//!
//! Loaded from `~/.config/ferry/config.toml` unless `--config` names another
//! file. Every field is optional; command-line flags win over the file.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ferry_xmpp::{ConnectOptions, StreamOptions};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    /// Account to log in as (e.g., user@example.com)
    pub jid: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Resource to request when the JID does not carry one
    pub resource: Option<String>,
    /// PEM files with extra certificates to trust
    pub extra_roots: Vec<PathBuf>,
    /// Server discovery, proxy and SSF settings
    pub connect: ConnectOptions,
    /// Negotiation policy
    pub stream: StreamOptions,
}

impl FerryConfig {
    /// Load `path`, or the default file when `path` is `None`. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: FerryConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ferry").join("config.toml"))
    }

    /// The JID with the configured resource appended when it has none.
    pub fn full_jid(&self) -> Option<String> {
        let jid = self.jid.as_deref()?;
        Some(match &self.resource {
            Some(resource) if !jid.contains('/') => format!("{jid}/{resource}"),
            _ => jid.to_string(),
        })
    }

    /// Read every certificate from the `extra_roots` files.
    pub fn load_roots(&self) -> Result<Vec<CertificateDer<'static>>> {
        let mut roots = Vec::new();
        for path in &self.extra_roots {
            let file = File::open(path)
                .with_context(|| format!("Failed to open certificate file: {}", path.display()))?;
            let certs = rustls_pemfile::certs(&mut BufReader::new(file))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Failed to parse certificates in {}", path.display()))?;
            if certs.is_empty() {
                anyhow::bail!("No certificates found in {}", path.display());
            }
            roots.extend(certs);
        }
        Ok(roots)
    }
}
