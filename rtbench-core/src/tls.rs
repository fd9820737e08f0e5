use std::path::Path;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    SignatureScheme,
};

use crate::error::{Error, Result};

/// Pins the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn init_crypto() {
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    );
}

pub fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::CertError(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())?.ok_or_else(|| {
        Error::CertError(format!("no private key found in {}", path.display()))
    })
}

/// Trust anchors from the given PEM bundle, or the Mozilla roots when none
/// is configured.
fn root_store(cas: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match cas {
        Some(path) => {
            let (added, _) = roots.add_parsable_certificates(load_cert_chain(path)?);
            if added == 0 {
                return Err(Error::CertError(format!(
                    "no usable certificates in {}",
                    path.display()
                )));
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

/// Client-side TLS for the tester's workers.
pub fn client_config(
    cas: Option<&Path>,
    cert: Option<&Path>,
    key: Option<&Path>,
    skip_name_check: bool,
) -> Result<ClientConfig> {
    init_crypto();
    let roots = Arc::new(root_store(cas)?);
    let builder = if skip_name_check {
        let inner = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|err| Error::CertError(err.to_string()))?;
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipNameVerifier { inner }))
    } else {
        ClientConfig::builder().with_root_certificates(roots)
    };
    match (cert, key) {
        (Some(cert), Some(key)) => Ok(builder
            .with_client_auth_cert(load_cert_chain(cert)?, load_private_key(key)?)?),
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// Server-side TLS for the mock. A client CA bundle makes client
/// certificates required and verified (mutual TLS).
pub fn server_config(cert: &Path, key: &Path, client_cas: Option<&Path>) -> Result<ServerConfig> {
    init_crypto();
    let builder = match client_cas {
        Some(path) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(Some(path))?))
                .build()
                .map_err(|err| Error::CertError(err.to_string()))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };
    Ok(builder.with_single_cert(load_cert_chain(cert)?, load_private_key(key)?)?)
}

/// Verifies the presented chain (leaf and intermediates) against the
/// trusted roots exactly like the stock webpki verifier, but forgives a
/// hostname mismatch. Expiry, signatures, and chain building still fail.
#[derive(Debug)]
struct SkipNameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for SkipNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
