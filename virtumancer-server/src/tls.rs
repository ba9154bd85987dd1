//! TLS certificate management.
//!
//! Ensures a certificate pair exists before the HTTPS server starts; when
//! none is found a self-signed certificate is generated. Production
//! deployments replace the pair on disk with a real one.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::info;

use crate::config::TlsConfig;

/// TLS certificate manager.
pub struct TlsManager {
    config: TlsConfig,
}

impl TlsManager {
    pub fn new(config: TlsConfig) -> Self {
        Self { config }
    }

    /// Ensure certificates exist, generating a self-signed pair if needed.
    pub async fn ensure_certificates(&self) -> Result<()> {
        for path in [&self.config.cert_path, &self.config.key_path] {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)
                        .context("Failed to create certificate directory")?;
                }
            }
        }

        let cert_exists = Path::new(&self.config.cert_path).exists();
        let key_exists = Path::new(&self.config.key_path).exists();

        if cert_exists && key_exists {
            info!(
                cert = %self.config.cert_path,
                key = %self.config.key_path,
                "Existing certificates found"
            );
            return Ok(());
        }

        info!("No certificates found, generating self-signed certificate");
        self.generate_self_signed()
    }

    /// Generate a self-signed certificate pair.
    pub fn generate_self_signed(&self) -> Result<()> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        let common_name = self
            .config
            .common_name
            .clone()
            .unwrap_or(hostname);

        info!(
            common_name = %common_name,
            validity_days = self.config.validity_days,
            "Generating self-signed certificate"
        );

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name.as_str());
        dn.push(DnType::OrganizationName, "Virtumancer");
        params.distinguished_name = dn;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::hours(1); // clock skew leeway
        params.not_after = now + time::Duration::days(self.config.validity_days as i64);

        let mut sans = vec![
            SanType::DnsName(
                common_name
                    .clone()
                    .try_into()
                    .map_err(|e| anyhow!("Invalid DNS name: {e}"))?,
            ),
            SanType::DnsName(
                "localhost"
                    .to_string()
                    .try_into()
                    .map_err(|e| anyhow!("Invalid DNS name: {e}"))?,
            ),
        ];
        if let Ok(ip) = "127.0.0.1".parse() {
            sans.push(SanType::IpAddress(ip));
        }
        if let Ok(ip) = "::1".parse() {
            sans.push(SanType::IpAddress(ip));
        }
        params.subject_alt_names = sans;

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.is_ca = IsCa::NoCa;

        let key_pair = KeyPair::generate().context("Failed to generate key pair")?;
        let cert = params
            .self_signed(&key_pair)
            .context("Failed to generate certificate")?;

        fs::write(&self.config.cert_path, cert.pem())
            .context("Failed to write certificate file")?;

        let key_pem = key_pair.serialize_pem();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::write(&self.config.key_path, &key_pem)
                .context("Failed to write private key file")?;
            fs::set_permissions(&self.config.key_path, fs::Permissions::from_mode(0o600))
                .context("Failed to set private key permissions")?;
        }
        #[cfg(not(unix))]
        {
            fs::write(&self.config.key_path, &key_pem)
                .context("Failed to write private key file")?;
        }

        info!(
            cert = %self.config.cert_path,
            key = %self.config.key_path,
            "Self-signed certificate generated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> TlsConfig {
        TlsConfig {
            cert_path: dir
                .path()
                .join("server.crt")
                .to_string_lossy()
                .to_string(),
            key_path: dir.path().join("server.key").to_string_lossy().to_string(),
            common_name: Some("test-host".to_string()),
            validity_days: 30,
        }
    }

    #[tokio::test]
    async fn generates_self_signed_pair() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let manager = TlsManager::new(config.clone());
        manager.ensure_certificates().await.unwrap();

        let cert = std::fs::read_to_string(&config.cert_path).unwrap();
        let key = std::fs::read_to_string(&config.key_path).unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn existing_pair_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let manager = TlsManager::new(config.clone());
        manager.ensure_certificates().await.unwrap();
        let first = std::fs::read_to_string(&config.cert_path).unwrap();

        manager.ensure_certificates().await.unwrap();
        let second = std::fs::read_to_string(&config.cert_path).unwrap();
        assert_eq!(first, second);
    }
}
