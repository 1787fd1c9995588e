// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Certificate authority for intercepted TLS connections.

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::PrivateKeyDer;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::fs;
use tracing::info;

const CA_COMMON_NAME: &str = "beyond-mitm CA";
const CA_ORGANIZATION: &str = "beyond-mitm";

/// Signs leaf certificates for intercepted hosts, one per host, cached.
pub struct CertificateAuthority {
    cert_pem: String,
    key_pair: KeyPair,
    leaves: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertificateAuthority {
    /// Load the CA from disk, or create and persist a new one.
    pub async fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        if cert_path.exists() && key_path.exists() {
            info!(path = %cert_path.display(), "loading CA");
            Self::load(cert_path, key_path).await
        } else {
            info!(path = %cert_path.display(), "generating CA");
            Self::generate_and_save(cert_path, key_path).await
        }
    }

    async fn load(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let cert_pem = fs::read_to_string(cert_path)
            .await
            .with_context(|| format!("failed to read CA cert {}", cert_path.display()))?;
        let key_pem = fs::read_to_string(key_path)
            .await
            .with_context(|| format!("failed to read CA key {}", key_path.display()))?;
        let key_pair = KeyPair::from_pem(&key_pem).context("failed to parse CA key")?;
        Ok(Arc::new(Self::from_parts(cert_pem, key_pair)))
    }

    async fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = ca_params()?.self_signed(&key_pair)?;
        let cert_pem = cert.pem();

        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(cert_path, &cert_pem).await?;
        fs::write(key_path, key_pair.serialize_pem()).await?;

        Ok(Arc::new(Self::from_parts(cert_pem, key_pair)))
    }

    fn from_parts(cert_pem: String, key_pair: KeyPair) -> Self {
        Self {
            cert_pem,
            key_pair,
            leaves: RwLock::new(HashMap::new()),
        }
    }

    /// Leaf certificate for `host`, signed by this CA.
    pub fn leaf_for(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(leaf) = self
            .leaves
            .read()
            .map_err(|e| anyhow::anyhow!("CA leaf cache poisoned: {}", e))?
            .get(host)
        {
            return Ok(leaf.clone());
        }

        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);
        params.use_authority_key_identifier_extension = false;

        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let issuer = Issuer::new(ca_params()?, &self.key_pair);
        let cert = params.signed_by(&leaf_key, &issuer)?;

        let cert_pem = cert.pem();
        let leaf_cert = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .context("no certificate in generated leaf PEM")??;
        let key_pem = leaf_key.serialize_pem();
        let key_der = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())
            .next()
            .context("no private key in generated leaf PEM")??;
        let signer = any_supported_type(&PrivateKeyDer::from(key_der))
            .map_err(|e| anyhow::anyhow!("failed to create leaf key signer: {}", e))?;
        let leaf = Arc::new(CertifiedKey::new(vec![leaf_cert], signer));

        self.leaves
            .write()
            .map_err(|e| anyhow::anyhow!("CA leaf cache poisoned: {}", e))?
            .insert(host.to_string(), leaf.clone());
        Ok(leaf)
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}

fn ca_params() -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![]).context("failed to create CA params")?;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params
        .distinguished_name
        .push(DnType::OrganizationName, CA_ORGANIZATION);
    Ok(params)
}
