use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum TrustError {
    #[snafu(display("failed to read certificate {}: {}", path.display(), source))]
    ReadCertificate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("certificate {} is not valid PEM: {}", path.display(), detail))]
    InvalidPem { path: PathBuf, detail: String },

    #[snafu(display("custom root certificate was not accepted: {}", source))]
    RejectedRoot { source: rustls::Error },

    #[snafu(display("cannot build TLS client configuration: {}", source))]
    Protocol { source: rustls::Error },

    #[snafu(display("cannot build certificate verifier: {}", source))]
    Verifier {
        source: rustls::client::VerifierBuilderError,
    },
}

/// How a TLS layer treats the peer certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// Evaluate the chain, report failures as warnings, never abort.
    #[serde(alias = "none")]
    AcceptAny,
    /// Abort the handshake unless the chain verifies.
    Peer,
}

/// Receives human-readable certificate warnings from a handshake in progress.
pub type WarningSink = Arc<dyn Fn(String) + Send + Sync>;

/// Trust settings for the two encryption layers of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustConfig {
    pub custom_root_path: Option<PathBuf>,
    pub proxy_verify: VerifyMode,
    pub target_verify: VerifyMode,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            custom_root_path: None,
            proxy_verify: VerifyMode::AcceptAny,
            target_verify: VerifyMode::Peer,
        }
    }
}

impl TrustConfig {
    pub fn with_custom_root(mut self, path: Option<PathBuf>) -> Self {
        self.custom_root_path = path;
        self
    }

    /// Freshly loaded trust for the hop to the proxy.
    pub fn proxy_layer(&self) -> Result<LayerTrust, TrustError> {
        self.layer(self.proxy_verify)
    }

    /// Freshly loaded trust for the tunnelled hop to the target.
    pub fn target_layer(&self) -> Result<LayerTrust, TrustError> {
        self.layer(self.target_verify)
    }

    fn layer(&self, verify: VerifyMode) -> Result<LayerTrust, TrustError> {
        let extra_roots = match &self.custom_root_path {
            Some(path) => load_certificates(path)?,
            None => Vec::new(),
        };
        Ok(LayerTrust {
            verify,
            extra_roots,
        })
    }
}

/// Trust material scoped to exactly one TLS layer.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerTrust {
    pub verify: VerifyMode,
    pub extra_roots: Vec<CertificateDer<'static>>,
}

impl LayerTrust {
    pub fn new(verify: VerifyMode) -> Self {
        Self {
            verify,
            extra_roots: Vec::new(),
        }
    }

    /// Built-in web roots plus any custom roots of this layer.
    pub fn root_store(&self) -> Result<RootCertStore, TrustError> {
        let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in &self.extra_roots {
            roots.add(cert.clone()).context(RejectedRootSnafu)?;
        }
        Ok(roots)
    }

    /// rustls client configuration for a handshake with `peer_name`.
    pub fn client_config(
        &self,
        peer_name: &str,
        warnings: WarningSink,
    ) -> Result<Arc<ClientConfig>, TrustError> {
        let provider = crypto_provider();
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .context(ProtocolSnafu)?;
        let roots = Arc::new(self.root_store()?);

        let mut config = match self.verify {
            VerifyMode::Peer => builder.with_root_certificates(roots).with_no_client_auth(),
            VerifyMode::AcceptAny => {
                let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
                    .build()
                    .context(VerifierSnafu)?;
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AdvisoryVerifier {
                        peer_name: peer_name.to_string(),
                        inner,
                        warnings,
                    }))
                    .with_no_client_auth()
            }
        };
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        debug!(
            "TLS config for {}: verify {:?}, {} custom roots",
            peer_name,
            self.verify,
            self.extra_roots.len()
        );
        Ok(Arc::new(config))
    }
}

pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Reads every certificate in a PEM file; a file without PEM blocks is taken as raw DER.
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TrustError> {
    let bytes = fs::read(path).context(ReadCertificateSnafu { path })?;
    let certs = CertificateDer::pem_slice_iter(&bytes)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TrustError::InvalidPem {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    if !certs.is_empty() {
        return Ok(certs);
    }
    if bytes.is_empty() {
        return Err(TrustError::InvalidPem {
            path: path.to_path_buf(),
            detail: "file is empty".to_string(),
        });
    }
    Ok(vec![CertificateDer::from(bytes)])
}

/// Runs the regular WebPKI checks but downgrades failures to warnings.
struct AdvisoryVerifier {
    peer_name: String,
    inner: Arc<WebPkiServerVerifier>,
    warnings: WarningSink,
}

impl fmt::Debug for AdvisoryVerifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AdvisoryVerifier")
            .field("peer_name", &self.peer_name)
            .finish()
    }
}

impl ServerCertVerifier for AdvisoryVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Err(e) =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            let message = format!("certificate of {} not trusted: {}", self.peer_name, e);
            warn!("{} (continuing)", message);
            (self.warnings)(message);
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn sink() -> (WarningSink, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sink: WarningSink = Arc::new(move |w| seen_clone.lock().unwrap().push(w));
        (sink, seen)
    }

    #[test]
    fn defaults_accept_proxy_and_verify_target() {
        let trust = TrustConfig::default();
        assert_eq!(trust.proxy_layer().unwrap().verify, VerifyMode::AcceptAny);
        assert_eq!(trust.target_layer().unwrap().verify, VerifyMode::Peer);
        assert!(trust.target_layer().unwrap().extra_roots.is_empty());
    }

    #[test]
    fn missing_root_file_is_reported_with_path() {
        let trust = TrustConfig::default()
            .with_custom_root(Some(PathBuf::from("/nonexistent/kitty-tunnel-ca.pem")));
        let err = trust.proxy_layer().unwrap_err();
        assert!(matches!(err, TrustError::ReadCertificate { .. }));
        assert!(err.to_string().contains("kitty-tunnel-ca.pem"));
    }

    #[test]
    fn empty_root_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        fs::write(&path, b"").unwrap();
        assert!(matches!(
            load_certificates(&path),
            Err(TrustError::InvalidPem { .. })
        ));
    }

    #[test]
    fn both_modes_build_a_config() {
        for verify in [VerifyMode::AcceptAny, VerifyMode::Peer] {
            let (warnings, _) = sink();
            let config = LayerTrust::new(verify)
                .client_config("example.com", warnings)
                .unwrap();
            assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        }
    }

    #[test]
    fn advisory_verifier_warns_and_accepts() {
        let (warnings, seen) = sink();
        let roots = Arc::new(LayerTrust::new(VerifyMode::AcceptAny).root_store().unwrap());
        let inner = WebPkiServerVerifier::builder_with_provider(roots, crypto_provider())
            .build()
            .unwrap();
        let verifier = AdvisoryVerifier {
            peer_name: "proxy.local".to_string(),
            inner,
            warnings,
        };
        let bogus = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x00]);
        let name = ServerName::try_from("proxy.local").unwrap();
        let verdict = verifier.verify_server_cert(&bogus, &[], &name, &[], UnixTime::now());
        assert!(verdict.is_ok());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("certificate of proxy.local not trusted"));
    }

    #[test]
    fn verify_mode_reads_legacy_name() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: VerifyMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"none\"").unwrap();
        assert_eq!(parsed.mode, VerifyMode::AcceptAny);
        let parsed: Wrapper = toml::from_str("mode = \"peer\"").unwrap();
        assert_eq!(parsed.mode, VerifyMode::Peer);
    }
}
