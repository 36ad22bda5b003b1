//! Ephemeral port allocation for test servers.
//!
//! Probes the OS for a free port by binding an ephemeral listener, reading
//! the assigned port, and releasing it immediately. The probe is inherently
//! racy since another process may grab the port before the real server binds
//! it, which is accepted for a test-fixture context.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use thiserror::Error;

/// Ports at or above this value are shifted down before being handed out,
/// keeping allocations inside the range the surrounding tooling expects.
pub const PORT_CEILING: u16 = 55535;

/// Step used when shifting an out-of-range port below [`PORT_CEILING`].
const PORT_STRIDE: u16 = 100;

/// Errors raised while probing for a free port.
#[derive(Debug, Error)]
pub enum Error {
    /// The OS refused to open or inspect the probe socket.
    #[error("could not probe for an ephemeral port: {0}")]
    Probe(#[from] std::io::Error),
}

/// Allocate a port believed to be free.
///
/// The returned port is always below [`PORT_CEILING`]; an out-of-range probe
/// result is adjusted by repeated subtraction of the stride. The adjusted
/// port is not re-probed for availability.
///
/// # Errors
///
/// Returns an error if the OS cannot supply a listening socket.
pub fn allocate_port() -> Result<u16, Error> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
    let port = listener.local_addr()?.port();
    drop(listener);

    Ok(clamp_below_ceiling(port))
}

/// Check if a port is available by attempting to bind to it.
#[must_use]
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).is_ok()
}

const fn clamp_below_ceiling(mut port: u16) -> u16 {
    while port >= PORT_CEILING {
        port -= PORT_STRIDE;
    }
    port
}
