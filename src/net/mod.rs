use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

pub mod endpoint;
pub mod link;
pub mod serve;
pub mod wire;

/// Converts an IP address and port to a socket address.
pub fn ip_addr_to_socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(ip) => SocketAddr::from((ip, port)),
        IpAddr::V6(ip) => SocketAddr::from((ip, port)),
    }
}

/// The address a process listens on for a given port, on every interface.
pub fn listen_addr(port: u16) -> SocketAddr {
    ip_addr_to_socket_addr(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

pub const DEFAULT_WORKER_PORT: u16 = 8030;
pub const DEFAULT_BROKER_PORT: u16 = 8034;

/// Name every self-signed certificate is issued for. Clients skip
/// verification, so this only has to be a valid DNS name.
const SERVER_NAME: &str = "gridcast";
/// Keeps connections open while a long `Run` produces no traffic.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on a compressed frame payload.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;
