use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::SwarmError;

const POWER_SUPPLY: &str = "/sys/class/power_supply";
const BATTERY_CMD_TIMEOUT: Duration = Duration::from_secs(5);

/// Battery percentage of this device, or 100 when it has none we can read.
pub async fn battery_level() -> u8 {
  if let Some(level) = sysfs_battery(Path::new(POWER_SUPPLY)) {
    return level;
  }
  if let Some(level) = termux_battery().await {
    return level;
  }
  100
}

fn sysfs_battery(root: &Path) -> Option<u8> {
  let entries = std::fs::read_dir(root).ok()?;
  entries
    .filter_map(|e| e.ok())
    .filter(|e| e.file_name().to_string_lossy().starts_with("BAT"))
    .find_map(|e| std::fs::read_to_string(e.path().join("capacity")).ok())
    .and_then(|raw| raw.trim().parse::<u8>().ok())
    .map(|level| level.min(100))
}

async fn termux_battery() -> Option<u8> {
  let output = tokio::time::timeout(BATTERY_CMD_TIMEOUT, Command::new("termux-battery-status").kill_on_drop(true).output())
    .await
    .ok()?
    .ok()?;
  if !output.status.success() {
    return None;
  }
  let status: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
  let level = status.get("percentage")?.as_f64()?;
  debug!(level, "Battery level from termux");
  Some(level.clamp(0.0, 100.0) as u8)
}

/// Capacity gate for claiming: `Err(Capacity)` when the device is too drained.
pub fn check(level: u8, threshold: u8) -> Result<(), SwarmError> {
  if level < threshold {
    Err(SwarmError::Capacity { level, threshold })
  } else {
    Ok(())
  }
}

/// Platform tag plus whatever the operator configured, deduplicated.
pub fn detect_capabilities(extra: &[String]) -> Vec<String> {
  let platform = if std::env::var_os("ANDROID_DATA").is_some() {
    "android"
  } else {
    match std::env::consts::OS {
      "macos" => "macos",
      "windows" => "windows",
      _ => "linux",
    }
  };
  let mut caps = vec![platform.to_string()];
  for cap in extra {
    if !caps.contains(cap) {
      caps.push(cap.clone());
    }
  }
  caps
}
