// Copyright (C) 2022-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of gelf-tracing.
//
// gelf-tracing is free software: you can redistribute it and/or modify it under the terms of the
// GNU General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// gelf-tracing is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with gelf-tracing.  If
// not, see <http://www.gnu.org/licenses/>.
//! GELF over TLS.
//!
//! [`TlsConnector`] layers a [rustls] client session over a [`TcpConnector`]'s stream. The
//! handshake is driven to completion inside [`Connector::connect`], so a collector presenting
//! an untrusted certificate looks to the [`Connection`](crate::connection::Connection) state
//! machine exactly like one that refused the connection.
//!
//! [rustls]: https://docs.rs/rustls

use crate::{
    connection::{Connector, TcpConnector},
    error::{Error, Result},
};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms},
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};
use tracing::{debug, warn};

use std::{
    net::TcpStream,
    path::{Path, PathBuf},
    sync::Arc,
};

/// How to establish trust with the collector (& optionally, how to identify ourselves to it).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSettings {
    trusted_certs: Vec<PathBuf>,
    native_roots: bool,
    client_auth: Option<(PathBuf, PathBuf)>,
    server_name: Option<String>,
    insecure: bool,
}

impl std::default::Default for TlsSettings {
    fn default() -> Self {
        TlsSettings {
            trusted_certs: Vec::new(),
            native_roots: true,
            client_auth: None,
            server_name: None,
            insecure: false,
        }
    }
}

impl TlsSettings {
    pub fn new() -> TlsSettings {
        TlsSettings::default()
    }
    /// Trust the CA certificate(s) in the PEM file at `path`
    pub fn trust<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.trusted_certs.push(path.into());
        self
    }
    /// Whether to trust the platform's root certificates as well
    pub fn native_roots(mut self, native_roots: bool) -> Self {
        self.native_roots = native_roots;
        self
    }
    /// Present the certificate chain in `cert` (PEM), signed with the private key in `key` (PEM)
    pub fn client_auth<P: Into<PathBuf>, Q: Into<PathBuf>>(mut self, cert: P, key: Q) -> Self {
        self.client_auth = Some((cert.into(), key.into()));
        self
    }
    /// Verify the collector's certificate against this name, rather than its host name
    pub fn server_name<S: Into<String>>(mut self, server_name: S) -> Self {
        self.server_name = Some(server_name.into());
        self
    }
    /// Skip verification of the collector's certificate entirely. Traffic is still encrypted,
    /// but anyone on the path can impersonate the collector.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }
    pub fn is_insecure(&self) -> bool {
        self.insecure
    }
    pub(crate) fn validate(&self) -> Result<()> {
        if self.insecure && !self.trusted_certs.is_empty() {
            return Err(Error::config(
                "trusted certificates are meaningless when verification is disabled",
            ));
        }
        if !self.insecure && !self.native_roots && self.trusted_certs.is_empty() {
            return Err(Error::config(
                "no trust anchors: supply CA certificates or enable the native roots",
            ));
        }
        Ok(())
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|err| {
            Error::config(format!(
                "couldn't read certificates from {}: {}",
                path.display(),
                err
            ))
        })?;
    if certs.is_empty() {
        return Err(Error::config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn root_store(settings: &TlsSettings) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    if settings.native_roots {
        let native = rustls_native_certs::load_native_certs();
        for err in native.errors {
            debug!("While loading native root certificates: {}", err);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        debug!(
            "Loaded {} native root certificates ({} ignored)",
            added, ignored
        );
    }
    for path in &settings.trusted_certs {
        for cert in load_certs(path)? {
            roots.add(cert).map_err(Error::tls)?;
        }
    }
    if roots.is_empty() {
        return Err(Error::config("no usable trusted certificates"));
    }
    Ok(roots)
}

/// Accepts any certificate; handshake signatures are still checked.
#[derive(Debug)]
struct NoVerification(WebPkiSupportedAlgorithms);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0)
    }
    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0)
    }
    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}

/// Build the rustls client configuration described by `settings`.
pub fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>> {
    settings.validate()?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(Error::tls)?;
    let builder = if settings.insecure {
        warn!("TLS certificate verification is disabled; the collector will not be authenticated");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(
                provider.signature_verification_algorithms,
            )))
    } else {
        builder.with_root_certificates(root_store(settings)?)
    };
    let config = match &settings.client_auth {
        Some((cert, key)) => {
            let chain = load_certs(cert)?;
            let key = PrivateKeyDer::from_pem_file(key).map_err(|err| {
                Error::config(format!(
                    "couldn't read a private key from {}: {}",
                    key.display(),
                    err
                ))
            })?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(Error::tls)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// TLS connections.
pub struct TlsConnector {
    tcp: TcpConnector,
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsConnector {
    pub fn new(tcp: TcpConnector, settings: &TlsSettings) -> Result<TlsConnector> {
        let name = settings
            .server_name
            .clone()
            .unwrap_or_else(|| tcp.host().to_string());
        let server_name = ServerName::try_from(name.as_str())
            .map(|name| name.to_owned())
            .map_err(|err| Error::config(format!("bad TLS server name '{}': {}", name, err)))?;
        Ok(TlsConnector {
            tcp,
            config: client_config(settings)?,
            server_name,
        })
    }
}

impl std::fmt::Display for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "tls+{}", self.tcp)
    }
}

impl Connector for TlsConnector {
    type Stream = StreamOwned<ClientConnection, TcpStream>;
    fn connect(&self) -> Result<Self::Stream> {
        let mut sock = self.tcp.open()?;
        // Don't hang forever on a peer that accepts the connection but never answers.
        sock.set_read_timeout(Some(self.tcp.handshake_timeout()))
            .map_err(Error::transport)?;
        let mut conn =
            ClientConnection::new(self.config.clone(), self.server_name.clone())
                .map_err(Error::tls)?;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock).map_err(Error::tls)?;
        }
        sock.set_read_timeout(None).map_err(Error::transport)?;
        Ok(StreamOwned::new(conn, sock))
    }
    fn shutdown(&self, stream: &mut Self::Stream) {
        stream.conn.send_close_notify();
        if let Err(err) = stream.conn.complete_io(&mut stream.sock) {
            debug!("While sending close_notify to {}: {}", self.tcp, err);
        }
        let _ = stream.sock.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod test {

    use super::*;

    use crate::connection::{Backoff, Connection, ConnectionState};

    use rustls::{ServerConfig, ServerConnection};

    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread::JoinHandle,
        time::Duration,
    };

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("data")
            .join(name)
    }

    /// A one-shot collector presenting a certificate for "collector.test" issued by `ca.pem`;
    /// yields everything it read.
    fn collector() -> (u16, JoinHandle<std::io::Result<Vec<u8>>>) {
        let chain = load_certs(&fixture("collector.pem")).unwrap();
        let key = PrivateKeyDer::from_pem_file(fixture("collector.key")).unwrap();
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (sock, _) = listener.accept()?;
            let conn = ServerConnection::new(Arc::new(config))
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
            let mut stream = StreamOwned::new(conn, sock);
            let mut received = Vec::new();
            stream.read_to_end(&mut received)?;
            Ok(received)
        });
        (port, server)
    }

    #[test]
    fn settings() {
        assert!(TlsSettings::new().validate().is_ok());
        assert!(TlsSettings::new()
            .native_roots(false)
            .validate()
            .is_err());
        assert!(TlsSettings::new()
            .native_roots(false)
            .insecure(true)
            .validate()
            .is_ok());
        assert!(TlsSettings::new()
            .trust("/etc/ssl/ca.pem")
            .insecure(true)
            .validate()
            .is_err());
    }

    #[test]
    fn bad_trust_files() {
        let settings = TlsSettings::new()
            .native_roots(false)
            .trust("/this/path/does/not/exist.pem");
        match client_config(&settings) {
            Err(Error::Config { .. }) => (),
            Err(err) => panic!("unexpected error {:?}", err),
            Ok(_) => panic!("a missing CA file should be an error"),
        }

        let mut empty = tempfile::NamedTempFile::new().unwrap();
        writeln!(empty, "not a certificate").unwrap();
        let settings = TlsSettings::new().native_roots(false).trust(empty.path());
        match client_config(&settings) {
            Err(Error::Config { reason, .. }) => assert!(reason.starts_with("no certificates")),
            Err(err) => panic!("unexpected error {:?}", err),
            Ok(_) => panic!("a CA file with no certificates should be an error"),
        }
    }

    #[test]
    fn insecure() {
        let settings = TlsSettings::new().native_roots(false).insecure(true);
        let connector =
            TlsConnector::new(TcpConnector::new("collector.example.com", 12201), &settings)
                .unwrap();
        assert_eq!(
            format!("{}", connector),
            "tls+tcp://collector.example.com:12201"
        );
    }

    #[test]
    fn server_names() {
        let settings = TlsSettings::new()
            .native_roots(false)
            .insecure(true)
            .server_name("not a valid name!");
        assert!(TlsConnector::new(TcpConnector::new("127.0.0.1", 12201), &settings).is_err());
        // IP addresses are legitimate server names
        let settings = TlsSettings::new().native_roots(false).insecure(true);
        assert!(TlsConnector::new(TcpConnector::new("127.0.0.1", 12201), &settings).is_ok());
    }

    #[test]
    fn handshake_failure_is_a_connect_failure() {
        // A listener that accepts & immediately hangs up: the handshake can't complete.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            drop(sock);
        });
        let settings = TlsSettings::new().native_roots(false).insecure(true);
        let connector = TlsConnector::new(TcpConnector::new("127.0.0.1", port), &settings).unwrap();
        assert!(connector.connect().is_err());
        server.join().unwrap();
    }

    #[test]
    fn trusted_collector() {
        let (port, server) = collector();
        let settings = TlsSettings::new()
            .native_roots(false)
            .trust(fixture("ca.pem"))
            .server_name("collector.test");
        let connector = TlsConnector::new(TcpConnector::new("127.0.0.1", port), &settings).unwrap();
        let mut conn = Connection::new(connector, Backoff::default());
        conn.send(b"{\"short_message\":\"one\"}").unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.send(b"{\"short_message\":\"two\"}").unwrap();
        // Sends close_notify, so the collector sees a clean end of stream
        conn.close();
        let received = server.join().unwrap().unwrap();
        assert_eq!(
            received,
            b"{\"short_message\":\"one\"}\0{\"short_message\":\"two\"}\0".to_vec()
        );
    }

    #[test]
    fn untrusted_collector() {
        let (port, server) = collector();
        let settings = TlsSettings::new()
            .native_roots(false)
            .trust(fixture("other-ca.pem"))
            .server_name("collector.test");
        let connector = TlsConnector::new(TcpConnector::new("127.0.0.1", port), &settings).unwrap();
        let mut conn = Connection::new(connector, Backoff::default());
        match conn.send(b"{}") {
            Err(Error::NotConnected { retry_in, .. }) => {
                assert_eq!(retry_in, Duration::from_secs(1))
            }
            Err(err) => panic!("unexpected error {:?}", err),
            Ok(()) => panic!("an untrusted collector was accepted"),
        }
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(conn.last_error().is_some());
        // The collector saw the handshake aborted, & never any payload
        assert!(server.join().unwrap().is_err());
    }
}
