//! HTTP control surface (spec §6, SPEC_FULL §4.9, C9).
//!
//! Every handler returns the same JSON envelope the distilled `web_api.py`
//! returns from (almost) every route: `{ call_from, reply, error }`. Where
//! a handler receives an out-of-range input it clamps to a fallback and
//! reports the clamp in `error` rather than rejecting the request (spec
//! §6's closing paragraph, §7 `InputOutOfRange`) — malformed *types* (e.g.
//! `speed=abc`) are instead rejected with `400` by axum's `Query`
//! extractor before a handler ever runs.
//!
//! Motion endpoints (`/m/right`, `/m/left`, `/m/stop`, `/m/gotopos`) go
//! through the coalescer rather than the command API directly: spec §4.5
//! lists HTTP as a producer of motor intents alongside DMX ingest, and
//! routing both through the same mailbox means a DMX frame and an HTTP
//! call racing for the same motor resolve with the same latest-wins rule
//! instead of two independent paths to the wire. Because of this, those
//! endpoints' `reply` reports whether the motor accepted the offer, not a
//! device `Reply` — there is no synchronous exchange to report on.
//! Read-only and axis-parameter endpoints call the command API directly
//! and surface the device's `Reply`.

use std::path::PathBuf;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use bridge_config::{NamedConfiguration, StoredArtnetConfig, StoredMotorConfig};
use dmx_ingest::DmxIngest;
use mcp_commands::MotionCommands;
use motor_coalescer::{Coalescer, MotorIntent};
use motor_registry::{Registry, RegistryDefaults};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

/// The safety ceiling clamp fallback the distilled source hard-codes for
/// `/m/right`, `/m/left`, and `/p/setaccel` (`speed=50`).
const SPEED_FALLBACK: i32 = 50;
/// Bound the original applies to `/m/gotopos` and `/p/setmaxpos`; wider
/// than any single motor's configured `max_pos`, it is a last-resort sanity
/// clamp rather than the operational one (SPEC_FULL §9).
const POS_BOUND: i32 = 100_000;

/// Everything an HTTP handler needs, generic over the transport's byte
/// stream so tests can run it over an in-memory duplex pipe.
pub struct AppState<S> {
    pub commands: Arc<MotionCommands<S>>,
    pub registry: Arc<Registry>,
    pub coalescer: Arc<Coalescer<S>>,
    pub ingest: Arc<DmxIngest>,
    pub config_dir: PathBuf,
    pub scan: ScanConfig,
}

/// Parameters `/p/scan` re-runs discovery with.
#[derive(Clone)]
pub struct ScanConfig {
    pub range: RangeInclusive<u8>,
    pub settle: Duration,
    pub defaults: RegistryDefaults,
}

#[derive(Serialize)]
struct Envelope {
    call_from: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Envelope {
    fn ok(call_from: &'static str, reply: impl Serialize) -> Json<Envelope> {
        Json(Envelope {
            call_from,
            reply: Some(json!(reply)),
            error: None,
        })
    }

    fn ok_empty(call_from: &'static str) -> Json<Envelope> {
        Json(Envelope { call_from, reply: None, error: None })
    }

    fn warn(call_from: &'static str, reply: impl Serialize, error: String) -> Json<Envelope> {
        Json(Envelope {
            call_from,
            reply: Some(json!(reply)),
            error: Some(error),
        })
    }

    fn err(call_from: &'static str, error: String) -> Json<Envelope> {
        Json(Envelope { call_from, reply: None, error: Some(error) })
    }
}

/// Clamp `value` into `lo..=hi`, returning the fallback and a warning
/// message naming `field` when it was out of range.
fn clamp_or_warn(field: &str, value: i32, lo: i32, hi: i32, fallback: i32) -> (i32, Option<String>) {
    if (lo..=hi).contains(&value) {
        (value, None)
    } else {
        (fallback, Some(format!("{field} {value} out of range [{lo}, {hi}]; using {fallback}")))
    }
}

#[derive(Deserialize)]
struct AddrSpeed {
    addr: u8,
    speed: i32,
}

#[derive(Deserialize)]
struct AddrAccel {
    addr: u8,
    accel: i32,
}

#[derive(Deserialize)]
struct AddrOnly {
    addr: u8,
}

#[derive(Deserialize)]
struct AddrPos {
    addr: u8,
    pos: i32,
}

#[derive(Deserialize)]
struct Universe {
    val: u16,
}

#[derive(Deserialize)]
struct SetAddr {
    current_addr: u8,
    new_addr: u8,
}

#[derive(Deserialize)]
struct ConfigName {
    name: String,
}

#[derive(Deserialize)]
struct SaveConfig {
    name: String,
    default: bool,
}

pub fn router<S>(state: Arc<AppState<S>>) -> Router
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    Router::new()
        .route("/m/right", get(m_right::<S>))
        .route("/m/left", get(m_left::<S>))
        .route("/m/stop", get(m_stop::<S>))
        .route("/m/setref", get(m_setref::<S>))
        .route("/m/gotopos", get(m_gotopos::<S>))
        .route("/p/setmaxpos", get(p_setmaxpos::<S>))
        .route("/p/setmaxspeed", get(p_setmaxspeed::<S>))
        .route("/p/setminspeed", get(p_setminspeed::<S>))
        .route("/p/setaccel", get(p_setaccel::<S>))
        .route("/p/gettemp", get(p_gettemp::<S>))
        .route("/p/getpos", get(p_getpos::<S>))
        .route("/p/panic", get(p_panic::<S>))
        .route("/p/set_artnet", get(p_set_artnet::<S>))
        .route("/p/get_artnet", get(p_get_artnet::<S>))
        .route("/p/connected", get(p_connected::<S>))
        .route("/p/get_universe", get(p_get_universe::<S>))
        .route("/p/set_universe", get(p_set_universe::<S>))
        .route("/p/set_addr", get(p_set_addr::<S>))
        .route("/p/scan", get(p_scan::<S>))
        .route("/p/version", get(p_version))
        .route("/c/save_config", get(c_save_config::<S>))
        .route("/c/list_config", get(c_list_config::<S>))
        .route("/c/load_config", get(c_load_config::<S>))
        .route("/c/delete_config", delete(c_delete_config::<S>))
        .with_state(state)
}

async fn m_right<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<AddrSpeed>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let (speed, warning) = clamp_or_warn("speed", q.speed, 1, state.commands.speed_ceiling(), SPEED_FALLBACK);
    let accepted = state.coalescer.offer(q.addr, MotorIntent::RotateRight(speed)).await;
    envelope_or_warn("m_right", json!({ "accepted": accepted }), warning).into_response()
}

async fn m_left<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<AddrSpeed>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let (speed, warning) = clamp_or_warn("speed", q.speed, 1, state.commands.speed_ceiling(), SPEED_FALLBACK);
    let accepted = state.coalescer.offer(q.addr, MotorIntent::RotateLeft(speed)).await;
    envelope_or_warn("m_left", json!({ "accepted": accepted }), warning).into_response()
}

async fn m_stop<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<AddrOnly>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let accepted = state.coalescer.offer(q.addr, MotorIntent::Stop).await;
    Envelope::ok("m_stop", json!({ "accepted": accepted })).into_response()
}

async fn m_setref<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<AddrOnly>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    match state.commands.set_axis(q.addr, mcp_commands::AXIS_PARAM_ACTUAL_POSITION, 0).await {
        Ok(reply) => Envelope::ok("m_setref", reply_json(reply)).into_response(),
        Err(err) => Envelope::err("m_setref", err.to_string()).into_response(),
    }
}

async fn m_gotopos<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<AddrPos>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let (pos, warning) = clamp_or_warn("pos", q.pos, -POS_BOUND, POS_BOUND, 0);
    let accepted = state.coalescer.offer(q.addr, MotorIntent::MoveTo(pos)).await;
    envelope_or_warn("m_gotopos", json!({ "accepted": accepted }), warning).into_response()
}

async fn p_setmaxpos<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<AddrPos>) -> Response
where
    S: Send + Sync + 'static,
{
    let (pos, warning) = clamp_or_warn("pos", q.pos, -POS_BOUND, POS_BOUND, 0);
    state.registry.update(q.addr, |r| r.max_pos = pos).await;
    envelope_or_warn("p_setmaxpos", Value::Null, warning).into_response()
}

async fn p_setmaxspeed<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<AddrSpeed>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let ceiling = state.commands.speed_ceiling();
    let fallback = match state.registry.get(q.addr).await {
        Some(record) => record.max_speed,
        None => ceiling,
    };
    let (speed, warning) = clamp_or_warn("speed", q.speed, 1, ceiling, fallback);
    let result = state.commands.set_axis(q.addr, mcp_commands::AXIS_PARAM_MAX_SPEED, speed).await;
    state.registry.update(q.addr, |r| r.max_speed = speed).await;
    match result {
        Ok(reply) => envelope_or_warn("p_setmaxspeed", reply_json(reply), warning).into_response(),
        Err(err) => Envelope::err("p_setmaxspeed", err.to_string()).into_response(),
    }
}

async fn p_setminspeed<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<AddrSpeed>) -> Response
where
    S: Send + Sync + 'static,
{
    let ceiling = state.commands.speed_ceiling();
    let fallback = match state.registry.get(q.addr).await {
        Some(record) => record.min_speed,
        None => 1,
    };
    let (speed, warning) = clamp_or_warn("speed", q.speed, 1, ceiling, fallback);
    state.registry.update(q.addr, |r| r.min_speed = speed).await;
    envelope_or_warn("p_setminspeed", Value::Null, warning).into_response()
}

async fn p_setaccel<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<AddrAccel>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let ceiling = state.commands.speed_ceiling();
    let (accel, warning) = clamp_or_warn("accel", q.accel, 1, ceiling, SPEED_FALLBACK);
    let result = state.commands.set_axis(q.addr, mcp_commands::AXIS_PARAM_ACCEL, accel).await;
    state.registry.update(q.addr, |r| r.accel = accel).await;
    match result {
        Ok(reply) => envelope_or_warn("p_setaccel", reply_json(reply), warning).into_response(),
        Err(err) => Envelope::err("p_setaccel", err.to_string()).into_response(),
    }
}

async fn p_gettemp<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<AddrOnly>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    match state.commands.get_io(q.addr, 9, 1).await {
        Ok(reply) => Envelope::ok("p_gettemp", reply_json(reply)).into_response(),
        Err(err) => Envelope::err("p_gettemp", err.to_string()).into_response(),
    }
}

async fn p_getpos<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<AddrOnly>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    match state.commands.get_axis(q.addr, mcp_commands::AXIS_PARAM_ACTUAL_POSITION).await {
        Ok(reply) => Envelope::ok("p_getpos", reply_json(reply)).into_response(),
        Err(err) => Envelope::err("p_getpos", err.to_string()).into_response(),
    }
}

async fn p_panic<S>(State(state): State<Arc<AppState<S>>>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    state.ingest.disable();
    let addrs = state.registry.addrs().await;
    let mut stopped = 0usize;
    for addr in &addrs {
        if state.coalescer.offer(*addr, MotorIntent::Stop).await {
            stopped += 1;
        }
    }
    Envelope::ok("p_panic", json!({ "stopped": stopped })).into_response()
}

async fn p_set_artnet<S>(State(state): State<Arc<AppState<S>>>) -> Response
where
    S: Send + Sync + 'static,
{
    let enabled = if state.ingest.is_enabled() {
        state.ingest.disable();
        false
    } else {
        state.ingest.enable();
        true
    };
    Envelope::ok("p_set_artnet", enabled).into_response()
}

async fn p_get_artnet<S>(State(state): State<Arc<AppState<S>>>) -> Response
where
    S: Send + Sync + 'static,
{
    Envelope::ok("p_get_artnet", state.ingest.is_enabled()).into_response()
}

async fn p_connected<S>(State(state): State<Arc<AppState<S>>>) -> Response
where
    S: Send + Sync + 'static,
{
    let motors: Vec<StoredMotorConfig> = state
        .registry
        .snapshot()
        .await
        .into_iter()
        .map(StoredMotorConfig::from)
        .collect();
    Envelope::ok("p_connected", motors).into_response()
}

async fn p_get_universe<S>(State(state): State<Arc<AppState<S>>>) -> Response
where
    S: Send + Sync + 'static,
{
    Envelope::ok("p_get_universe", state.ingest.universe()).into_response()
}

async fn p_set_universe<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<Universe>) -> Response
where
    S: Send + Sync + 'static,
{
    let (val, warning) = clamp_or_warn("universe", i32::from(q.val), 0, 1024, 0);
    state.ingest.set_universe(val as u16);
    envelope_or_warn("p_set_universe", Value::Null, warning).into_response()
}

async fn p_set_addr<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<SetAddr>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    match state.commands.set_global(q.current_addr, 65, 0, i32::from(q.new_addr)).await {
        Ok(reply) => Envelope::ok("p_set_addr", reply_json(reply)).into_response(),
        Err(err) => Envelope::err("p_set_addr", err.to_string()).into_response(),
    }
}

async fn p_scan<S>(State(state): State<Arc<AppState<S>>>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let found = mcp_discovery::scan(
        &state.commands,
        state.scan.range.clone(),
        state.scan.defaults,
        state.scan.settle,
    )
    .await;
    let addrs: Vec<u8> = found.iter().map(|m| m.addr).collect();
    state.registry.replace(found).await;
    state.coalescer.reconcile(&addrs).await;
    Envelope::ok("p_scan", addrs).into_response()
}

async fn p_version() -> Response {
    Envelope::ok("p_version", env!("CARGO_PKG_VERSION")).into_response()
}

async fn c_save_config<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<SaveConfig>) -> Response
where
    S: Send + Sync + 'static,
{
    let motors = state
        .registry
        .snapshot()
        .await
        .into_iter()
        .map(StoredMotorConfig::from)
        .collect();
    let config = NamedConfiguration {
        motors,
        artnet: StoredArtnetConfig { universe: state.ingest.universe() },
    };
    match bridge_config::save_named(&state.config_dir, &q.name, &config, q.default).await {
        Ok(()) => Envelope::ok_empty("c_save_config").into_response(),
        Err(err) => Envelope::err("c_save_config", err.to_string()).into_response(),
    }
}

async fn c_list_config<S>(State(state): State<Arc<AppState<S>>>) -> Response
where
    S: Send + Sync + 'static,
{
    match bridge_config::list_named(&state.config_dir).await {
        Ok(summaries) => Envelope::ok("c_list_config", summaries).into_response(),
        Err(err) => Envelope::err("c_list_config", err.to_string()).into_response(),
    }
}

async fn c_load_config<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<ConfigName>) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    match bridge_config::load_named(&state.config_dir, &q.name).await {
        Ok(config) => {
            let addrs: Vec<u8> = config.motors.iter().map(|m| m.addr).collect();
            state.registry.replace(config.motors.iter().map(|m| m.into_record())).await;
            state.ingest.set_universe(config.artnet.universe);
            state.coalescer.reconcile(&addrs).await;
            Envelope::ok("c_load_config", config).into_response()
        }
        Err(err) => Envelope::err("c_load_config", err.to_string()).into_response(),
    }
}

async fn c_delete_config<S>(State(state): State<Arc<AppState<S>>>, Query(q): Query<ConfigName>) -> Response
where
    S: Send + Sync + 'static,
{
    match bridge_config::delete_named(&state.config_dir, &q.name).await {
        Ok(()) => Envelope::ok_empty("c_delete_config").into_response(),
        Err(err) => Envelope::err("c_delete_config", err.to_string()).into_response(),
    }
}

fn envelope_or_warn(call_from: &'static str, reply: impl Serialize, warning: Option<String>) -> Json<Envelope> {
    match warning {
        Some(warning) => {
            warn!(call_from, %warning, "http input clamped");
            Envelope::warn(call_from, reply, warning)
        }
        None => Envelope::ok(call_from, reply),
    }
}

fn reply_json(reply: mcp_protocol::Reply) -> Value {
    json!({
        "reply_addr": reply.reply_addr,
        "module_addr": reply.module_addr,
        "status": reply.status,
        "opcode_echo": reply.opcode_echo,
        "value": reply.value,
    })
}
