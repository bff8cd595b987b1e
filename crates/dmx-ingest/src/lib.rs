//! Art-Net/DMX UDP ingest and channel-to-intent translation (spec §4.6, C6).
//!
//! Validates each datagram (magic header, opcode, universe), then maps each
//! discovered motor's 5-channel slot onto at most one motion intent and one
//! position intent per frame, which are handed to the per-motor coalescer.
//! The listener can be toggled on and off at runtime; while disabled,
//! datagrams are still parsed (for observability) but no intents are
//! emitted (spec §4.6).
//!
//! The distilled source contains a bug the spec explicitly calls out (§9):
//! an `elif` chain across channels that makes CH2/CH3 unreachable whenever
//! CH1 matches, and direction labels swapped between `rol`/`ror`. This
//! module follows the corrected semantics in spec §4.6, not the buggy
//! original.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use motor_coalescer::{Coalescer, MotorIntent};
use motor_registry::Registry;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tracing::{trace, warn};

const ARTNET_HEADER: &[u8; 8] = b"Art-Net\0";
const OPCODE_DMX: u16 = 0x5000;

/// Runtime-toggleable DMX universe filter and enable flag (spec §4.6: "The
/// listener may be enabled or disabled at runtime").
pub struct DmxIngest {
    universe: AtomicU32,
    enabled: AtomicBool,
}

impl DmxIngest {
    pub fn new(universe: u16) -> Self {
        Self {
            universe: AtomicU32::new(universe as u32),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn universe(&self) -> u16 {
        self.universe.load(Ordering::Relaxed) as u16
    }

    pub fn set_universe(&self, universe: u16) {
        self.universe.store(universe as u32, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }
}

/// Validate an Art-Net datagram and extract its DMX channel data, if
/// `datagram` is an `ArtDmx` packet (opcode `0x5000`) addressed to
/// `universe`. Anything else — wrong magic, wrong opcode, wrong universe,
/// truncated header — returns `None` and is silently dropped by the caller
/// (spec §4.6, §7: "C6 drops malformed packets silently; never crashes the
/// listener").
///
/// Art-Net's `ArtDmx` `Data[]` field leads with the DMX-512 start code
/// (conventionally `0x00`) before slot 1's value; this function strips that
/// leading byte so the returned slice is indexed the way spec §4.6's
/// channel-group formula and its worked example (§8 scenario 4) both
/// assume: index 0 is DMX channel 1.
pub fn parse_artnet_dmx(datagram: &[u8], universe: u16) -> Option<&[u8]> {
    if datagram.len() < 18 || &datagram[0..8] != ARTNET_HEADER {
        return None;
    }
    let opcode = u16::from_le_bytes([datagram[8], datagram[9]]);
    if opcode != OPCODE_DMX {
        return None;
    }
    let packet_universe = u16::from_le_bytes([datagram[14], datagram[15]]);
    if packet_universe != universe {
        return None;
    }
    let declared_len = u16::from_be_bytes([datagram[16], datagram[17]]) as usize;
    let end = (18 + declared_len).min(datagram.len());
    let data = &datagram[18..end];
    Some(data.get(1..).unwrap_or(&[]))
}

/// The 5-channel slot `spec.md` §4.6 assigns to motor `addr` (`addr ≥ 1`
/// reads channels `[addr-1 .. addr+3]`, 0-indexed, of the channel data
/// returned by [`parse_artnet_dmx`]). Returns `None` if fewer than 5
/// channels are available — that motor is skipped for this frame.
pub fn motor_channel_slice(payload: &[u8], addr: u8) -> Option<&[u8]> {
    if addr == 0 {
        return None;
    }
    let start = usize::from(addr - 1);
    payload.get(start..start + 5)
}

/// Affine mapping of `x` from `src_lo..=src_hi` onto `dst_lo..=dst_hi`. The
/// degenerate case `src_lo == src_hi` returns `dst_lo` rather than
/// dividing by zero (spec §4.6).
pub fn map_value(x: i32, src_lo: i32, src_hi: i32, dst_lo: i32, dst_hi: i32) -> i32 {
    if src_lo == src_hi {
        return dst_lo;
    }
    let ratio = f64::from(x - src_lo) / f64::from(src_hi - src_lo);
    (f64::from(dst_lo) + ratio * f64::from(dst_hi - dst_lo)).round() as i32
}

/// The at-most-one motion intent and at-most-one position intent a single
/// motor's 5-channel slot produces within one DMX frame (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelIntents {
    pub motion: Option<MotorIntent>,
    pub position: Option<MotorIntent>,
}

/// Translate one motor's 5-channel slot into intents, per the precedence
/// rules of spec §4.6: CH1 is consulted first and, if it matches any rule,
/// CH2/CH3 are not consulted in the same frame; CH4/CH5 are evaluated
/// independently of CH1-3, and CH5 (homing) overrides CH4 (explicit
/// position) when both would emit.
pub fn translate_motor(channels: &[u8], max_speed: i32, min_speed: i32, max_pos: i32) -> ChannelIntents {
    debug_assert!(channels.len() >= 5, "caller must supply a full 5-channel slot");
    let (ch1, ch2, ch3, ch4, ch5) = (channels[0], channels[1], channels[2], channels[3], channels[4]);

    let motion = if (2..=127).contains(&ch1) {
        Some(MotorIntent::RotateLeft(map_value(i32::from(ch1), 2, 127, max_speed, min_speed)))
    } else if ch1 == 128 {
        Some(MotorIntent::Stop)
    } else if (129..=255).contains(&ch1) {
        Some(MotorIntent::RotateRight(map_value(i32::from(ch1), 129, 255, min_speed, max_speed)))
    } else if (3..=255).contains(&ch2) {
        Some(MotorIntent::RotateLeft(map_value(i32::from(ch2), 3, 255, min_speed, max_speed)))
    } else if (1..=2).contains(&ch2) {
        Some(MotorIntent::Stop)
    } else if (3..=255).contains(&ch3) {
        Some(MotorIntent::RotateRight(map_value(i32::from(ch3), 3, 255, min_speed, max_speed)))
    } else if (1..=2).contains(&ch3) {
        Some(MotorIntent::Stop)
    } else {
        None
    };

    let position = if ch5 >= 2 {
        Some(MotorIntent::MoveTo(0))
    } else if ch4 >= 2 {
        Some(MotorIntent::MoveTo(map_value(i32::from(ch4), 2, 255, 1, max_pos)))
    } else {
        None
    };

    ChannelIntents { motion, position }
}

/// Validate, translate, and dispatch one received datagram. Exposed
/// separately from [`run`] so it can be exercised without a real socket.
pub async fn process_datagram<S>(
    ingest: &DmxIngest,
    registry: &Registry,
    coalescer: &Coalescer<S>,
    datagram: &[u8],
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let universe = ingest.universe();
    let Some(payload) = parse_artnet_dmx(datagram, universe) else {
        return;
    };
    trace!(bytes = payload.len(), universe, "dmx frame accepted");

    if !ingest.is_enabled() {
        return;
    }

    for motor in registry.snapshot().await {
        let Some(channels) = motor_channel_slice(payload, motor.addr) else {
            continue;
        };
        let intents = translate_motor(channels, motor.max_speed, motor.min_speed, motor.max_pos);
        if let Some(motion) = intents.motion {
            coalescer.offer(motor.addr, motion).await;
        }
        if let Some(position) = intents.position {
            coalescer.offer(motor.addr, position).await;
        }
    }
}

/// Receive datagrams forever, dispatching each through [`process_datagram`].
/// Never returns on its own; malformed packets and recv errors are logged
/// and do not stop the loop (spec §7).
pub async fn run<S>(
    socket: UdpSocket,
    ingest: Arc<DmxIngest>,
    registry: Arc<Registry>,
    coalescer: Arc<Coalescer<S>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = [0u8; 1024];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, _src)) => process_datagram(&ingest, &registry, &coalescer, &buf[..n]).await,
            Err(err) => warn!(%err, "dmx socket recv failed"),
        }
    }
}
