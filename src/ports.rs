use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::env::Env;
use crate::error::{Error, Result};

// The console-port bounds and the dynamic-allocation start match the debug
// bridge's emulator auto-discovery range. Changing them breaks `adb devices`
// visibility for anything launched outside the range.
pub const CONSOLE_PORT_MIN: u16 = 5554;
pub const CONSOLE_PORT_MAX: u16 = 5800;
pub const DYNAMIC_PORT_START: u16 = 5580;

const PORT_PROBE_ATTEMPTS: u32 = 3;
const PORT_PROBE_DELAY: Duration = Duration::from_secs(2);

pub(crate) fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Returns the first even port in `[start, end)` whose pair
/// `port`/`port + 1` both bind on loopback. An odd `start` is rounded up.
pub fn find_free_even_port(start: u16, end: u16) -> Result<u16> {
    let mut port = if start % 2 != 0 {
        start.saturating_add(1)
    } else {
        start
    };
    while port < end {
        if let Ok(first) = TcpListener::bind(("127.0.0.1", port)) {
            if let Ok(second) = TcpListener::bind(("127.0.0.1", port + 1)) {
                drop(first);
                drop(second);
                return Ok(port);
            }
        }
        port += 2;
    }
    Err(Error::collision(format!(
        "no free even port in {start}..{end}"
    )))
}

/// Rejects ports the emulator cannot use: outside the console range, or
/// odd (the emulator claims the pair `port`/`port + 1`).
pub fn validate_console_port(port: u16) -> Result<()> {
    if !(CONSOLE_PORT_MIN..=CONSOLE_PORT_MAX).contains(&port) {
        return Err(Error::precondition(format!(
            "port {port} is outside the valid console range {CONSOLE_PORT_MIN}-{CONSOLE_PORT_MAX}"
        )));
    }
    if port % 2 != 0 {
        return Err(Error::precondition(format!(
            "port {port} is odd; the emulator requires an even console port (it claims the pair {port} and {})",
            port + 1
        )));
    }
    Ok(())
}

/// Probes the pair before a launch, retrying to ride out sockets stuck in
/// TIME_WAIT after a recent teardown.
pub(crate) fn ensure_port_pair_free(env: &Env, port: u16) -> Result<()> {
    for attempt in 0..PORT_PROBE_ATTEMPTS {
        env.cancel.checkpoint()?;
        if is_port_free(port) && is_port_free(port + 1) {
            return Ok(());
        }
        if attempt + 1 < PORT_PROBE_ATTEMPTS {
            debug!(
                target: "avdpool",
                "ensure_port_pair_free: ports {}/{} busy, retrying in {:?}",
                port,
                port + 1,
                PORT_PROBE_DELAY
            );
            thread::sleep(PORT_PROBE_DELAY);
        }
    }
    Err(Error::collision(format!(
        "port {} or {} still in use after {} probes (sockets may be in TIME_WAIT)",
        port,
        port + 1,
        PORT_PROBE_ATTEMPTS
    )))
}
