//! TLS material: loads a certificate/key pair from disk, generating a self-signed pair on first
//! run so a fresh install comes up without an external PKI step.

use std::io::BufReader;
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8Path;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::Conf;

pub fn install_default_crypto_provider() {
    // Only one provider can be installed process-wide; a second call (e.g. from a test
    // harness that also uses rustls) is a harmless no-op.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

pub fn build_server_config(conf: &Conf) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    ensure_self_signed_material(conf)?;

    let certs = load_certs(&conf.tls_certificate)?;
    let key = load_private_key(&conf.tls_private_key)?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/private key pair")?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(server_config))
}

fn load_certs(path: &Utf8Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).with_context(|| format!("couldn't open {path}"))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("couldn't parse certificate(s) in {path}"))
}

fn load_private_key(path: &Utf8Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).with_context(|| format!("couldn't open {path}"))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("couldn't parse private key in {path}"))?
        .with_context(|| format!("no private key found in {path}"))
}

/// Generates a self-signed certificate/key pair covering `localhost` and the host's own name,
/// if the configured paths do not already exist. Meant for first-run convenience; a production
/// deployment is expected to overwrite these with material from a real CA.
fn ensure_self_signed_material(conf: &Conf) -> anyhow::Result<()> {
    if conf.tls_certificate.exists() && conf.tls_private_key.exists() {
        return Ok(());
    }

    let hostname = hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_else(|| "localhost".to_owned());
    let mut subject_alt_names = vec!["localhost".to_owned()];
    if hostname != "localhost" {
        subject_alt_names.push(hostname);
    }

    let generated = rcgen::generate_simple_self_signed(subject_alt_names).context("couldn't generate self-signed certificate")?;
    let cert_pem = generated.cert.pem();
    let key_pem = generated.signing_key.serialize_pem();

    if let Some(parent) = conf.tls_certificate.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&conf.tls_certificate, cert_pem).with_context(|| format!("couldn't write {}", conf.tls_certificate))?;
    std::fs::write(&conf.tls_private_key, key_pem).with_context(|| format!("couldn't write {}", conf.tls_private_key))?;

    info!(cert = %conf.tls_certificate, key = %conf.tls_private_key, "generated self-signed TLS material");
    Ok(())
}
