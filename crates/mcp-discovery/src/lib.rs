//! Bus-wide address sweep that builds the connected-motor table (spec §4.4,
//! C4).
//!
//! Discovery probes every candidate address with a read that any MCP module
//! will answer (`get_io`, port 9, bank 1 — a temperature query by
//! convention; spec §9 notes any opcode eliciting a checkable reply would
//! do). A timeout or address mismatch means "no motor there", not a
//! failure; any other frame error is logged and treated the same way. The
//! whole sweep is bounded in time by `range.len() * (timeout + settle)`.

use std::ops::RangeInclusive;
use std::time::Duration;

use mcp_commands::{CommandError, MotionCommands};
use mcp_transport::TransportError;
use mcp_protocol::FrameError;
use motor_registry::{MotorRecord, RegistryDefaults};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// The GIO port probed for liveness (a temperature sensor on the reference
/// firmware; any port that elicits a reply would serve equally well).
pub const PROBE_PORT: u8 = 9;
pub const PROBE_BANK: u8 = 1;

/// MCP broadcast address; never probed (spec §4.4).
pub const BROADCAST_ADDR: u8 = 0;

/// Sweep `range` for connected motors, seeding each discovered record from
/// `defaults`. Every candidate address gets a `settle` pre-wait before the
/// probe is sent, to let the bus recover from the previous exchange, then
/// the probe itself is bounded by `timeout`.
///
/// Does not touch a `Registry` itself — callers decide when and how to
/// install the result (typically `Registry::replace`), matching spec §4.4's
/// "Result replaces the registry atomically at end of scan" without this
/// crate taking a dependency on the exact replacement policy.
pub async fn scan<S>(
    commands: &MotionCommands<S>,
    range: RangeInclusive<u8>,
    defaults: RegistryDefaults,
    settle: Duration,
) -> Vec<MotorRecord>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut found = Vec::new();

    for addr in range {
        if addr == BROADCAST_ADDR {
            continue;
        }

        tokio::time::sleep(settle).await;

        match commands.get_io(addr, PROBE_PORT, PROBE_BANK).await {
            Ok(reply) => {
                info!(addr, temp = reply.value, "motor found");
                found.push(defaults.seed(addr, Some(reply.value)));
            }
            Err(CommandError {
                source: TransportError::Timeout(_),
                ..
            }) => {
                debug!(addr, "no motor: timed out");
            }
            Err(CommandError {
                source: TransportError::Frame(FrameError::AddrMismatch { .. }),
                ..
            }) => {
                debug!(addr, "no motor: address mismatch");
            }
            Err(err) => {
                warn!(addr, %err, "discovery probe failed, treating as absent");
            }
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_protocol::{encode_request, STATUS_OK};
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// A fake bus that replies only for addresses in `present`, and simply
    /// never answers (forcing a timeout) otherwise.
    async fn run_fake_bus(mut device: DuplexStream, present: Vec<u8>) {
        loop {
            let mut req = [0u8; 9];
            if device.read_exact(&mut req).await.is_err() {
                return;
            }
            let addr = req[0];
            if present.contains(&addr) {
                let reply = encode_request(0xFF, addr, STATUS_OK, req[1], 42);
                let _ = device.write_all(&reply).await;
            }
            // else: drop the request on the floor, forcing the caller to time out.
        }
    }

    #[tokio::test]
    async fn scan_finds_only_present_addresses_and_excludes_broadcast() {
        let (a, b) = duplex(4096);
        let commands = MotionCommands::new(Arc::new(mcp_transport::BusTransport::from_stream(a)))
            .with_timeout(Duration::from_millis(20));

        tokio::spawn(run_fake_bus(b, vec![3, 7]));

        let found = scan(
            &commands,
            0..=10,
            RegistryDefaults::default(),
            Duration::from_millis(1),
        )
        .await;

        let mut addrs: Vec<u8> = found.iter().map(|m| m.addr).collect();
        addrs.sort();
        assert_eq!(addrs, vec![3, 7]);
        assert!(!addrs.contains(&0), "broadcast address must never be probed");
    }

    #[tokio::test]
    async fn scan_with_no_devices_returns_empty_registry() {
        let (a, b) = duplex(4096);
        let commands = MotionCommands::new(Arc::new(mcp_transport::BusTransport::from_stream(a)))
            .with_timeout(Duration::from_millis(5));
        tokio::spawn(run_fake_bus(b, vec![]));

        let found = scan(
            &commands,
            1..=20,
            RegistryDefaults::default(),
            Duration::from_millis(1),
        )
        .await;

        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn discovered_record_carries_probed_temperature() {
        let (a, b) = duplex(4096);
        let commands = MotionCommands::new(Arc::new(mcp_transport::BusTransport::from_stream(a)))
            .with_timeout(Duration::from_millis(20));
        tokio::spawn(run_fake_bus(b, vec![5]));

        let found = scan(
            &commands,
            5..=5,
            RegistryDefaults::default(),
            Duration::from_millis(1),
        )
        .await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].last_known_temp, Some(42));
    }
}
