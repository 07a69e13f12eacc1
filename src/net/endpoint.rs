use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::SystemTime,
};

use quinn::Connecting;
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate as RustlsCert, PrivateKey, ServerName,
};
use tracing::debug;

use super::{link::Link, KEEP_ALIVE_INTERVAL, SERVER_NAME};
use crate::Error;

/// A QUIC endpoint that can both accept links and dial out.
///
/// Every endpoint carries a freshly generated self-signed certificate and
/// dials without verifying the peer's: links are encrypted by QUIC but not
/// authenticated.
#[derive(Clone)]
pub struct Endpoint {
    ep: quinn::Endpoint,
}

impl Endpoint {
    /// Binds an endpoint that accepts incoming links on `socket_addr`.
    pub fn server(socket_addr: SocketAddr) -> Result<Self, Error> {
        let (client_config, server_config) = Self::configs()?;
        let mut ep = quinn::Endpoint::server(server_config, socket_addr)?;
        ep.set_default_client_config(client_config);
        debug!(addr = %ep.local_addr()?, "endpoint bound");
        Ok(Self { ep })
    }

    /// Binds a dial-only endpoint on an ephemeral port.
    pub fn client() -> Result<Self, Error> {
        let (client_config, _) = Self::configs()?;
        let mut ep =
            quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        ep.set_default_client_config(client_config);
        Ok(Self { ep })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.ep.local_addr()?)
    }

    /// Waits for the next incoming connection. Returns `None` once the
    /// endpoint has been closed.
    pub async fn accept(&self) -> Option<Connecting> {
        self.ep.accept().await
    }

    pub async fn connect(&self, remote: SocketAddr) -> Result<Link, Error> {
        Link::connect(&self.ep, remote).await
    }

    /// Closes every connection on this endpoint immediately.
    pub fn close(&self) {
        self.ep.close(0u32.into(), b"endpoint closed");
    }

    fn configs() -> Result<(quinn::ClientConfig, quinn::ServerConfig), Error> {
        let (client_tls, server_tls) = Self::tls_config()?;

        // shared transport configuration for the server and client sides
        // this is the default config with the BBR congestion controller enabled
        let mut transport_config = quinn::TransportConfig::default();
        let bbr_config = quinn::congestion::BbrConfig::default();
        transport_config.congestion_controller_factory(Arc::new(bbr_config));
        transport_config.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
        let transport_config = Arc::new(transport_config);

        let mut server_config =
            quinn::ServerConfig::with_crypto(Arc::new(server_tls));
        server_config.transport_config(transport_config.clone());

        let mut client_config = quinn::ClientConfig::new(Arc::new(client_tls));
        client_config.transport_config(transport_config);

        Ok((client_config, server_config))
    }

    /// Returns rustls configurations for a self-signed certificate.
    fn tls_config() -> Result<(rustls::ClientConfig, rustls::ServerConfig), Error>
    {
        let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])?;
        let key = PrivateKey(cert.serialize_private_key_der());
        let cert = RustlsCert(cert.serialize_der()?);

        let client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();

        let server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)?;

        Ok((client_config, server_config))
    }
}

/// Peers are not authenticated, so any server certificate is accepted.
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &RustlsCert,
        _intermediates: &[RustlsCert],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
