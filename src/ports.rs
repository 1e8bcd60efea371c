//! Loopback port reservation for the application process.

use std::net::TcpListener;

use crate::error::ProxyError;

/// Reserves a loopback TCP port for the application. A preferred port of 0
/// asks the OS for any free ephemeral port; a busy preferred port silently
/// falls back to a random one.
///
/// The listener is dropped before returning, so the port is only reserved in
/// the advisory sense: the application is expected to bind it shortly after.
pub fn allocate(preferred: u16) -> Result<u16, ProxyError> {
    if preferred == 0 {
        let listener =
            TcpListener::bind("127.0.0.1:0").map_err(ProxyError::PortAllocation)?;
        let port = listener
            .local_addr()
            .map_err(ProxyError::PortAllocation)?
            .port();
        return Ok(port);
    }

    match TcpListener::bind(("127.0.0.1", preferred)) {
        Ok(_) => Ok(preferred),
        Err(_) => allocate(0),
    }
}

/// Whether a loopback port is currently free to bind.
pub fn is_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
