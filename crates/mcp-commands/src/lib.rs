//! Typed wrappers over the subset of MCP opcodes the bridge uses (spec §4.3).
//!
//! Every wrapper fixes the opcode for its operation, maps its typed
//! arguments onto `type`/`bank`/`value`, runs one `exchange` on the shared
//! transport, and forwards any failure with opcode/address context attached.

use std::sync::Arc;
use std::time::Duration;

use mcp_protocol::Reply;
use mcp_transport::{BusTransport, TransportError, DEFAULT_TIMEOUT};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Axis parameter number TMCL-compatible firmware uses for maximum speed;
/// `set_axis`/`get_axis` calls against this parameter are clamped to the
/// configured safety ceiling, matching the original source's `sap(a, 4, s)`.
pub const AXIS_PARAM_MAX_SPEED: u8 = 4;
/// Axis parameter number for acceleration (`sap(a, 5, acc)` in the original).
pub const AXIS_PARAM_ACCEL: u8 = 5;
/// Axis parameter number used to zero a motor's position ("set as home").
pub const AXIS_PARAM_ACTUAL_POSITION: u8 = 1;

/// Default safety ceiling for user-supplied speed/acceleration values
/// (spec §4.3; device range is 1..=2047).
pub const DEFAULT_SPEED_CEILING: i32 = 1000;

const OP_ROTATE_RIGHT: u8 = 1;
const OP_ROTATE_LEFT: u8 = 2;
const OP_STOP: u8 = 3;
const OP_MOVE_TO: u8 = 4;
const OP_SET_AXIS: u8 = 5;
const OP_GET_AXIS: u8 = 6;
const OP_STORE_AXIS: u8 = 7;
const OP_RESTORE_AXIS: u8 = 8;
const OP_SET_GLOBAL: u8 = 9;
const OP_GET_GLOBAL: u8 = 10;
const OP_STORE_GLOBAL: u8 = 11;
const OP_RESTORE_GLOBAL: u8 = 12;
const OP_REF_SEARCH: u8 = 13;
const OP_SET_IO: u8 = 14;
const OP_GET_IO: u8 = 15;
const OP_WAIT: u8 = 27;

/// `move_to`'s positioning mode (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMode {
    Absolute,
    Relative,
    Coordinate,
}

impl MoveMode {
    fn wire_value(self) -> u8 {
        match self {
            MoveMode::Absolute => 0,
            MoveMode::Relative => 1,
            MoveMode::Coordinate => 2,
        }
    }
}

/// `ref_search`'s control mode (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefSearchMode {
    Start,
    Stop,
    Status,
}

impl RefSearchMode {
    fn wire_value(self) -> u8 {
        match self {
            RefSearchMode::Start => 0,
            RefSearchMode::Stop => 1,
            RefSearchMode::Status => 2,
        }
    }
}

#[derive(Debug, Error)]
#[error("mcp {opcode_name} (addr {addr}) failed: {source}")]
pub struct CommandError {
    pub addr: u8,
    pub opcode_name: &'static str,
    #[source]
    pub source: TransportError,
}

/// Typed façade over a [`BusTransport`]; the only crate that knows the MCP
/// opcode table.
pub struct MotionCommands<S> {
    transport: Arc<BusTransport<S>>,
    timeout: Duration,
    speed_ceiling: i32,
}

impl<S> MotionCommands<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(transport: Arc<BusTransport<S>>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
            speed_ceiling: DEFAULT_SPEED_CEILING,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_speed_ceiling(mut self, ceiling: i32) -> Self {
        self.speed_ceiling = ceiling;
        self
    }

    pub fn speed_ceiling(&self) -> i32 {
        self.speed_ceiling
    }

    fn clamp_speed(&self, value: i32) -> i32 {
        value.clamp(1, self.speed_ceiling)
    }

    async fn run(
        &self,
        addr: u8,
        opcode: u8,
        opcode_name: &'static str,
        typ: u8,
        bank: u8,
        value: i32,
    ) -> Result<Reply, CommandError> {
        let request = mcp_protocol::encode_request(addr, opcode, typ, bank, value);
        self.transport
            .exchange(request, addr, opcode, self.timeout)
            .await
            .map_err(|source| CommandError {
                addr,
                opcode_name,
                source,
            })
    }

    /// Continuous rotation in the "right" direction (opcode 1). `velocity`
    /// is clamped to the configured safety ceiling before it hits the wire.
    pub async fn rotate_right(&self, addr: u8, velocity: i32) -> Result<Reply, CommandError> {
        let velocity = self.clamp_speed(velocity);
        self.run(addr, OP_ROTATE_RIGHT, "rotate_right", 0, 0, velocity).await
    }

    /// Continuous rotation in the "left" direction (opcode 2).
    pub async fn rotate_left(&self, addr: u8, velocity: i32) -> Result<Reply, CommandError> {
        let velocity = self.clamp_speed(velocity);
        self.run(addr, OP_ROTATE_LEFT, "rotate_left", 0, 0, velocity).await
    }

    /// Halt all motion on `addr` (opcode 3).
    pub async fn stop(&self, addr: u8) -> Result<Reply, CommandError> {
        self.run(addr, OP_STOP, "stop", 0, 0, 0).await
    }

    /// Absolute/relative/coordinate move (opcode 4).
    pub async fn move_to(&self, addr: u8, mode: MoveMode, bank: u8, value: i32) -> Result<Reply, CommandError> {
        self.run(addr, OP_MOVE_TO, "move_to", mode.wire_value(), bank, value).await
    }

    /// Set an axis parameter (opcode 5). Speed/accel parameters are clamped
    /// to the safety ceiling.
    pub async fn set_axis(&self, addr: u8, param: u8, value: i32) -> Result<Reply, CommandError> {
        let value = if param == AXIS_PARAM_MAX_SPEED || param == AXIS_PARAM_ACCEL {
            self.clamp_speed(value)
        } else {
            value
        };
        self.run(addr, OP_SET_AXIS, "set_axis", param, 0, value).await
    }

    /// Read an axis parameter (opcode 6).
    pub async fn get_axis(&self, addr: u8, param: u8) -> Result<Reply, CommandError> {
        self.run(addr, OP_GET_AXIS, "get_axis", param, 0, 0).await
    }

    /// Persist an axis parameter to non-volatile memory (opcode 7).
    pub async fn store_axis(&self, addr: u8, param: u8) -> Result<Reply, CommandError> {
        self.run(addr, OP_STORE_AXIS, "store_axis", param, 0, 0).await
    }

    /// Restore an axis parameter from non-volatile memory (opcode 8).
    pub async fn restore_axis(&self, addr: u8, param: u8) -> Result<Reply, CommandError> {
        self.run(addr, OP_RESTORE_AXIS, "restore_axis", param, 0, 0).await
    }

    /// Set a global parameter or user variable (opcode 9). `bank` is
    /// conventionally 0 (global), 2 (user variable), or 3 (interrupt config).
    pub async fn set_global(&self, addr: u8, param: u8, bank: u8, value: i32) -> Result<Reply, CommandError> {
        self.run(addr, OP_SET_GLOBAL, "set_global", param, bank, value).await
    }

    /// Read a global parameter (opcode 10).
    pub async fn get_global(&self, addr: u8, param: u8, bank: u8) -> Result<Reply, CommandError> {
        self.run(addr, OP_GET_GLOBAL, "get_global", param, bank, 0).await
    }

    /// Persist a user variable to non-volatile memory (opcode 11).
    pub async fn store_global(&self, addr: u8, param: u8) -> Result<Reply, CommandError> {
        self.run(addr, OP_STORE_GLOBAL, "store_global", param, 2, 0).await
    }

    /// Restore a user variable from non-volatile memory (opcode 12).
    pub async fn restore_global(&self, addr: u8, param: u8) -> Result<Reply, CommandError> {
        self.run(addr, OP_RESTORE_GLOBAL, "restore_global", param, 2, 0).await
    }

    /// Start/stop/query the firmware's reference search (opcode 13).
    pub async fn ref_search(&self, addr: u8, mode: RefSearchMode) -> Result<Reply, CommandError> {
        self.run(addr, OP_REF_SEARCH, "ref_search", mode.wire_value(), 0, 0).await
    }

    /// Set a digital output (opcode 14). `value` is conventionally 0 or 1.
    pub async fn set_io(&self, addr: u8, port: u8, value: i32) -> Result<Reply, CommandError> {
        self.run(addr, OP_SET_IO, "set_io", port, 2, value).await
    }

    /// Read a digital or analog input (opcode 15). `bank` selects
    /// digital/analog port groups per the device manual (0/1/2).
    pub async fn get_io(&self, addr: u8, port: u8, bank: u8) -> Result<Reply, CommandError> {
        self.run(addr, OP_GET_IO, "get_io", port, bank, 0).await
    }

    /// Program-mode wait (opcode 27). No HTTP endpoint calls this directly;
    /// it exists for completeness of the opcode table (spec §4.3).
    pub async fn wait(&self, addr: u8, mode: u8, bank: u8, ticks: i32) -> Result<Reply, CommandError> {
        self.run(addr, OP_WAIT, "wait", mode, bank, ticks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_protocol::STATUS_OK;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn harness() -> (MotionCommands<DuplexStream>, DuplexStream) {
        let (a, b) = duplex(256);
        (MotionCommands::new(Arc::new(BusTransport::from_stream(a))), b)
    }

    async fn serve_one(device: &mut DuplexStream, value: i32) {
        let mut req = [0u8; 9];
        device.read_exact(&mut req).await.unwrap();
        let reply = mcp_protocol::encode_request(0xFF, req[0], STATUS_OK, req[1], value);
        device.write_all(&reply).await.unwrap();
    }

    #[tokio::test]
    async fn rotate_right_clamps_velocity_to_ceiling() {
        let (cmds, mut device) = harness().await;
        let call = tokio::spawn(async move { cmds.rotate_right(5, 50_000).await });

        let mut req = [0u8; 9];
        device.read_exact(&mut req).await.unwrap();
        let value = i32::from_be_bytes([req[4], req[5], req[6], req[7]]);
        assert_eq!(value, DEFAULT_SPEED_CEILING);

        let reply = mcp_protocol::encode_request(0xFF, 5, STATUS_OK, 1, value);
        device.write_all(&reply).await.unwrap();
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn set_axis_max_speed_is_clamped_but_other_params_are_not() {
        let (cmds, mut device) = harness().await;
        let call = tokio::spawn(async move { cmds.set_axis(9, AXIS_PARAM_MAX_SPEED, 9_999).await });
        let mut req = [0u8; 9];
        device.read_exact(&mut req).await.unwrap();
        let value = i32::from_be_bytes([req[4], req[5], req[6], req[7]]);
        assert_eq!(value, DEFAULT_SPEED_CEILING);
        let reply = mcp_protocol::encode_request(0xFF, 9, STATUS_OK, 5, value);
        device.write_all(&reply).await.unwrap();
        call.await.unwrap().unwrap();

        let (cmds2, mut device2) = harness().await;
        let call2 = tokio::spawn(async move { cmds2.set_axis(9, 1, 12_345).await });
        let mut req2 = [0u8; 9];
        device2.read_exact(&mut req2).await.unwrap();
        let value2 = i32::from_be_bytes([req2[4], req2[5], req2[6], req2[7]]);
        assert_eq!(value2, 12_345, "non-speed params must not be clamped");
        let reply2 = mcp_protocol::encode_request(0xFF, 9, STATUS_OK, 5, value2);
        device2.write_all(&reply2).await.unwrap();
        call2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn move_to_encodes_mode_into_type_byte() {
        let (cmds, mut device) = harness().await;
        let call = tokio::spawn(async move { cmds.move_to(3, MoveMode::Relative, 0, -42).await });
        let mut req = [0u8; 9];
        device.read_exact(&mut req).await.unwrap();
        assert_eq!(req[2], 1); // MoveMode::Relative wire value
        let value = i32::from_be_bytes([req[4], req[5], req[6], req[7]]);
        assert_eq!(value, -42);
        let reply = mcp_protocol::encode_request(0xFF, req[0], STATUS_OK, req[1], value);
        device.write_all(&reply).await.unwrap();
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn get_io_is_not_clamped_and_opcode_context_is_attached_on_failure() {
        let (cmds, mut device) = harness().await;
        let call = tokio::spawn(async move { cmds.get_io(9, 9, 1).await });
        serve_one(&mut device, 37).await;
        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.value, 37);

        let (cmds2, device2) = harness().await;
        drop(device2);
        let err = cmds2.stop(9).await.unwrap_err();
        assert_eq!(err.opcode_name, "stop");
        assert_eq!(err.addr, 9);
    }
}
