//! Subcommand implementations. Results go to stdout as JSON.

use anyhow::{bail, Context, Result};
use obd_client::protocol::{lookup_pid, mode, Pid};
use obd_client::{ControlCommand, ObdClient};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

pub fn emit<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}

/// Parse a PID given as hex, with or without `0x`
pub fn parse_pid(s: &str) -> Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|_| format!("invalid PID: {}", s))
}

fn hex(pids: &[u8]) -> Vec<String> {
    pids.iter().map(|pid| format!("{:02X}", pid)).collect()
}

pub async fn negotiate(client: &mut ObdClient, pretty: bool) -> Result<()> {
    let transport = client.negotiate().await?;
    emit(
        &json!({
            "transport": transport.to_string(),
            "device": client.capabilities(),
        }),
        pretty,
    )
}

pub async fn query(client: &ObdClient, pids: &[u8], pretty: bool) -> Result<()> {
    let mut values = Vec::with_capacity(pids.len());
    for &pid in pids {
        if lookup_pid(pid).is_none() {
            bail!("PID {:02X} has no conversion", pid);
        }
        values.push(client.query(pid).await?);
    }
    emit(&values, pretty)
}

pub async fn supported_pids(client: &ObdClient, freeze_frame: bool, pretty: bool) -> Result<()> {
    let service = if freeze_frame {
        mode::FREEZE_FRAME
    } else {
        mode::CURRENT_DATA
    };
    let pids = client.supported_pids(service).await?;
    emit(&json!({ "mode": service, "pids": hex(&pids) }), pretty)
}

pub async fn dtcs(client: &ObdClient, pending: bool, pretty: bool) -> Result<()> {
    let entries = if pending {
        client.read_pending_dtcs().await?
    } else {
        client.read_dtcs().await?
    };
    emit(&entries, pretty)
}

pub async fn freeze_frame(client: &ObdClient, dtc: &str, pretty: bool) -> Result<()> {
    let frames = client.read_freeze_frame(dtc).await?;
    if frames.is_empty() {
        warn!("No freeze frame stored for {}", dtc);
    }
    emit(&frames, pretty)
}

pub async fn clear(client: &ObdClient, confirmed: bool, pretty: bool) -> Result<()> {
    if !confirmed {
        bail!("clearing trouble codes also erases freeze frames; pass --yes to confirm");
    }
    let cleared = client.clear_dtcs().await?;
    emit(&json!({ "cleared": cleared }), pretty)
}

pub async fn voltage(client: &ObdClient, pretty: bool) -> Result<()> {
    let voltage = client.read_voltage().await?;
    emit(&json!({ "voltage": voltage }), pretty)
}

pub async fn status(client: &ObdClient, pretty: bool) -> Result<()> {
    emit(&client.device_status().await?, pretty)
}

pub async fn write(client: &ObdClient, parameter: &str, value: f64, pretty: bool) -> Result<()> {
    let command = ControlCommand::new(parameter, value);
    client
        .write_command(&command)
        .await
        .with_context(|| format!("Refused to write {} = {}", parameter, value))?;
    emit(&json!({ "written": command }), pretty)
}

/// Stream samples as JSON lines until `duration` elapses or Ctrl-C
pub async fn monitor(
    client: &mut ObdClient,
    pids: &[u8],
    interval: Duration,
    duration: Option<Duration>,
) -> Result<()> {
    let pids = if pids.is_empty() {
        Pid::default_monitor_set()
    } else {
        pids.to_vec()
    };
    client.start_monitoring(&pids, interval).await?;
    info!("Monitoring {:?} every {:?}", hex(&pids), interval);

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(interval);
    let mut next_round = 0;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {
                let mut fresh: Vec<_> = client
                    .monitor_history(16)
                    .into_iter()
                    .filter(|sample| sample.round >= next_round)
                    .collect();
                fresh.reverse();
                for sample in fresh {
                    next_round = sample.round + 1;
                    emit(&sample, false)?;
                }
            }
        }
    }

    let failures = client.monitor_failures();
    client.stop_monitoring().await;
    for (pid, count) in failures.iter().filter(|(_, count)| **count > 0) {
        warn!("PID {:02X} failing ({} in a row)", pid, count);
    }
    Ok(())
}
