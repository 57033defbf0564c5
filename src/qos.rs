//! Per-tap traffic shaping, expressed as `tc` qdisc chains.
//!
//! Rate limiting is a token-bucket filter at the root; loss and delay are
//! netem. When both are requested, netem hangs off tbf as a child so the
//! chain is `tbf (1:) -> netem (2:)`; either alone sits at the root.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::process::ToolRunner;
use crate::{Error, Result};

/// Accepted rate units.
pub const RATE_UNITS: [&str; 3] = ["kbit", "mbit", "gbit"];

/// Desired shaping state for one tap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QosParams {
    /// Token-bucket rate, e.g. `1mbit`. Unit ∈ {kbit, mbit, gbit}.
    pub rate: Option<String>,
    /// Packet loss percentage in [0, 100).
    pub loss: Option<f64>,
    /// Added latency.
    pub delay: Option<Duration>,
}

impl QosParams {
    pub fn is_empty(&self) -> bool {
        self.rate.is_none() && self.loss.is_none() && self.delay.is_none()
    }

    fn has_netem(&self) -> bool {
        self.loss.is_some() || self.delay.is_some()
    }

    /// Human-readable delay, `""` when unset.
    pub fn delay_display(&self) -> String {
        self.delay
            .map(|d| humantime::format_duration(d).to_string())
            .unwrap_or_default()
    }

    /// Human-readable loss, `""` when unset.
    pub fn loss_display(&self) -> String {
        self.loss.map(|l| format!("{}", l)).unwrap_or_default()
    }
}

/// Validate and normalize a rate string like `10mbit`.
pub fn parse_rate(rate: &str) -> Result<String> {
    let unit = RATE_UNITS
        .iter()
        .find(|u| rate.ends_with(*u))
        .ok_or_else(|| Error::Validation(format!("invalid rate unit in {:?}", rate)))?;
    let digits = &rate[..rate.len() - unit.len()];
    digits
        .parse::<u64>()
        .map_err(|_| Error::Validation(format!("invalid rate: {:?}", rate)))?;
    Ok(rate.to_string())
}

/// Validate a loss percentage.
pub fn parse_loss(loss: &str) -> Result<f64> {
    let value: f64 = loss
        .parse()
        .map_err(|_| Error::Validation(format!("invalid loss: {:?}", loss)))?;
    if !(0.0..100.0).contains(&value) {
        return Err(Error::Validation(format!(
            "loss must be in [0, 100): {}",
            value
        )));
    }
    Ok(value)
}

/// Parse a delay. Bare integers are milliseconds; otherwise any humantime
/// duration (`10ms`, `1s`, `2m`) is accepted.
pub fn parse_delay(delay: &str) -> Result<Duration> {
    if let Ok(ms) = delay.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    delay
        .parse::<humantime::Duration>()
        .map(Into::into)
        .map_err(|_| Error::Validation(format!("invalid delay: {:?}", delay)))
}

fn netem_args(params: &QosParams, out: &mut Vec<String>) {
    out.push("netem".into());
    if let Some(loss) = params.loss {
        out.push("loss".into());
        out.push(format!("{}%", loss));
    }
    if let Some(delay) = params.delay {
        out.push("delay".into());
        out.push(format!("{}ms", delay.as_millis()));
    }
}

/// Build the `tc` invocations that move `tap` from the `prev` chain to the
/// `next` chain.
///
/// `change` is used only when the same qdisc kind stays in the same position;
/// a shape change tears the root down first and rebuilds with `add`.
pub fn chain_commands(tap: &str, prev: Option<&QosParams>, next: &QosParams) -> Vec<Vec<String>> {
    let mut cmds = Vec::new();

    let prev_tbf = prev.map(|p| p.rate.is_some()).unwrap_or(false);
    let prev_netem = prev.map(|p| p.has_netem()).unwrap_or(false);
    let next_tbf = next.rate.is_some();
    let next_netem = next.has_netem();

    // Same root kind and same shape: in-place change.
    let same_shape = prev_tbf == next_tbf && prev_netem == next_netem;
    if !same_shape && (prev_tbf || prev_netem) {
        cmds.push(delete_root(tap));
    }
    let reuse = same_shape;

    if next_tbf {
        let rate = next.rate.as_deref().unwrap_or_default();
        let op = if reuse && prev_tbf { "change" } else { "add" };
        let mut cmd: Vec<String> = ["tc", "qdisc", op, "dev", tap, "root", "handle", "1:", "tbf"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cmd.extend([
            "rate".to_string(),
            rate.to_string(),
            "latency".to_string(),
            "5ms".to_string(),
            "burst".to_string(),
            rate.to_string(),
        ]);
        cmds.push(cmd);
    }

    if next_netem {
        let op = if reuse && prev_netem { "change" } else { "add" };
        let mut cmd: Vec<String> = vec!["tc".into(), "qdisc".into(), op.into(), "dev".into(), tap.into()];
        if next_tbf {
            cmd.extend(["parent".to_string(), "1:".to_string(), "handle".to_string(), "2:".to_string()]);
        } else {
            cmd.extend(["root".to_string(), "handle".to_string(), "1:".to_string()]);
        }
        netem_args(next, &mut cmd);
        cmds.push(cmd);
    }

    cmds
}

/// The `tc` invocation clearing all shaping from `tap`.
pub fn delete_root(tap: &str) -> Vec<String> {
    ["tc", "qdisc", "del", "dev", tap, "root"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Apply a chain update through the tool runner.
///
/// On failure the root qdisc is removed so the interface falls back to
/// NoQos, and the tool's stderr propagates to the caller.
pub async fn apply(
    tools: &dyn ToolRunner,
    tap: &str,
    prev: Option<&QosParams>,
    next: &QosParams,
) -> Result<()> {
    for cmd in chain_commands(tap, prev, next) {
        if let Err(e) = tools.run(&cmd).await {
            let _ = tools.run(&delete_root(tap)).await;
            return Err(e);
        }
    }
    Ok(())
}

/// Remove all shaping from `tap`.
pub async fn clear(tools: &dyn ToolRunner, tap: &str) -> Result<()> {
    tools.run(&delete_root(tap)).await.map(|_| ())
}
