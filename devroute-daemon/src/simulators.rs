use std::collections::BTreeMap;
use std::time::Duration;

use devroute_protocol::Simulator;
use serde::Deserialize;

const SIMCTL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct SimctlList {
    #[serde(default)]
    devices: BTreeMap<String, Vec<SimctlDevice>>,
}

#[derive(Deserialize)]
struct SimctlDevice {
    name: String,
    udid: String,
    state: String,
}

/// Booted iOS simulators, or nothing when `simctl` is unavailable.
pub async fn booted_simulators() -> Vec<Simulator> {
    if !cfg!(target_os = "macos") {
        return Vec::new();
    }

    let output = tokio::process::Command::new("xcrun")
        .args(["simctl", "list", "devices", "booted", "-j"])
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(SIMCTL_TIMEOUT, output).await {
        Ok(Ok(out)) if out.status.success() => {
            parse_simctl_json(&String::from_utf8_lossy(&out.stdout))
        }
        Ok(Ok(out)) => {
            tracing::debug!(status = %out.status, "simctl exited unsuccessfully");
            Vec::new()
        }
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "failed to run simctl");
            Vec::new()
        }
        Err(_) => {
            tracing::debug!("simctl timed out");
            Vec::new()
        }
    }
}

pub fn parse_simctl_json(json: &str) -> Vec<Simulator> {
    let Ok(list) = serde_json::from_str::<SimctlList>(json) else {
        return Vec::new();
    };
    list.devices
        .into_values()
        .flatten()
        .filter(|d| d.state == "Booted")
        .map(|d| Simulator {
            name: d.name,
            udid: d.udid,
            state: d.state,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_only_booted_devices() {
        let json = r#"{
          "devices": {
            "com.apple.CoreSimulator.SimRuntime.iOS-17-0": [
              {"name": "iPhone 15", "udid": "AAAA-1111", "state": "Booted", "isAvailable": true},
              {"name": "iPad", "udid": "BBBB-2222", "state": "Shutdown"}
            ],
            "com.apple.CoreSimulator.SimRuntime.iOS-18-0": [
              {"name": "iPhone 16", "udid": "CCCC-3333", "state": "Booted"}
            ]
          }
        }"#;
        let sims = parse_simctl_json(json);
        let udids: Vec<_> = sims.iter().map(|s| s.udid.as_str()).collect();
        assert_eq!(udids, vec!["AAAA-1111", "CCCC-3333"]);
        assert_eq!(sims[0].name, "iPhone 15");
    }

    #[test]
    fn garbage_yields_empty_list() {
        assert!(parse_simctl_json("xcrun: error").is_empty());
        assert!(parse_simctl_json("{}").is_empty());
    }
}
