//! Platform certificate store access.

use async_trait::async_trait;
use std::sync::Arc;

use super::certificate::CertificateBundle;
use crate::error::CertificateError;

/// A source of certificates addressed by thumbprint.
///
/// Thumbprints passed in are already normalized (40 uppercase hex digits).
#[async_trait]
pub trait CertificateStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn find(&self, thumbprint: &str) -> Result<CertificateBundle, CertificateError>;
}

/// Store for platforms without a system certificate store we can read.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedStore;

#[async_trait]
impl CertificateStore for UnsupportedStore {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    async fn find(&self, _thumbprint: &str) -> Result<CertificateBundle, CertificateError> {
        Err(CertificateError::UnsupportedPlatform)
    }
}

/// The store implementation for the running platform.
pub fn platform_store() -> Arc<dyn CertificateStore> {
    #[cfg(windows)]
    {
        Arc::new(windows::WindowsCertificateStore::default())
    }
    #[cfg(not(windows))]
    {
        Arc::new(UnsupportedStore)
    }
}

#[cfg(windows)]
pub use windows::WindowsCertificateStore;

#[cfg(windows)]
mod windows {
    use async_trait::async_trait;
    use base64::{Engine, engine::general_purpose::STANDARD};
    use log::debug;
    use tokio::process::Command;

    use super::CertificateStore;
    use crate::auth::certificate::{CertificateBundle, parse_pkcs12};
    use crate::error::CertificateError;

    const NOT_FOUND_EXIT: i32 = 3;

    /// Reads `Cert:\CurrentUser\My` and `Cert:\LocalMachine\My` by exporting
    /// the matching certificate through PowerShell as a PFX protected by a
    /// one-off password.
    #[derive(Debug, Clone)]
    pub struct WindowsCertificateStore {
        shell: String,
    }

    impl Default for WindowsCertificateStore {
        fn default() -> Self {
            Self {
                shell: "powershell.exe".to_string(),
            }
        }
    }

    #[async_trait]
    impl CertificateStore for WindowsCertificateStore {
        fn name(&self) -> &'static str {
            "windows"
        }

        async fn find(&self, thumbprint: &str) -> Result<CertificateBundle, CertificateError> {
            let password = uuid::Uuid::new_v4().simple().to_string();
            let script = format!(
                "$cert = Get-ChildItem -Path 'Cert:\\CurrentUser\\My\\{tp}','Cert:\\LocalMachine\\My\\{tp}' -ErrorAction SilentlyContinue | Select-Object -First 1\n\
                 if (-not $cert) {{ exit {missing} }}\n\
                 $secure = ConvertTo-SecureString -String '{pw}' -AsPlainText -Force\n\
                 $bytes = $cert.Export([System.Security.Cryptography.X509Certificates.X509ContentType]::Pfx, $secure)\n\
                 [Convert]::ToBase64String($bytes)",
                tp = thumbprint,
                missing = NOT_FOUND_EXIT,
                pw = password,
            );

            debug!("Exporting certificate {} from the Windows store", thumbprint);
            let output = Command::new(&self.shell)
                .args(["-NoProfile", "-NonInteractive", "-Command", &script])
                .output()
                .await
                .map_err(|e| CertificateError::Malformed(format!("cannot start {}: {}", self.shell, e)))?;

            if output.status.code() == Some(NOT_FOUND_EXIT) {
                return Err(CertificateError::NotFound(thumbprint.to_string()));
            }
            if !output.status.success() {
                return Err(CertificateError::Malformed(format!(
                    "certificate export failed (is the private key exportable?): {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }

            let encoded = String::from_utf8_lossy(&output.stdout);
            let pfx = STANDARD
                .decode(encoded.trim())
                .map_err(|e| CertificateError::Malformed(format!("unexpected export output: {}", e)))?;

            parse_pkcs12(&pfx, Some(&password))
        }
    }
}
