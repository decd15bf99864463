//! KMS probe - reports what kmsflip would drive on a DRM node.
//! Run with: cargo run --bin kms-probe -- /dev/dri/card0
//!
//! Outputs JSON with connectors, CRTCs, planes and the chosen output. Nothing
//! is committed to the device.

use std::path::PathBuf;
use std::process::ExitCode;

use kmsflip::platform::drm::{probe, DeviceReport};
use kmsflip::util::logging;

fn report_json(path: &str, report: &DeviceReport) -> serde_json::Value {
    let connectors: Vec<_> = report
        .connectors
        .iter()
        .map(|c| {
            serde_json::json!({
                "id": c.id,
                "name": c.name,
                "connected": c.connected,
                "modes": c.modes,
            })
        })
        .collect();
    let planes: Vec<_> = report
        .planes
        .iter()
        .map(|p| serde_json::json!({ "id": p.id, "primary": p.primary, "crtcs": p.crtcs }))
        .collect();
    let target = match &report.target {
        Some(t) => serde_json::json!({
            "name": t.name,
            "width": t.width,
            "height": t.height,
            "refresh": t.refresh,
            "connector": t.connector,
            "crtc": t.crtc,
            "plane": t.plane,
        }),
        None => serde_json::Value::Null,
    };

    serde_json::json!({
        "device": path,
        "atomic": report.atomic,
        "connectors": connectors,
        "crtcs": report.crtcs,
        "planes": planes,
        "target": target,
    })
}

fn main() -> ExitCode {
    logging::init(false);

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/dev/dri/card0"));
    let shown = path.display().to_string();

    let mut out = serde_json::json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let status = match probe(&path) {
        Ok(report) => {
            out["kms"] = report_json(&shown, &report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(target: logging::KMS, "Probe of {} failed: {}", shown, e);
            out["kms"] = serde_json::json!({ "device": shown, "error": e.to_string() });
            ExitCode::FAILURE
        }
    };

    match serde_json::to_string_pretty(&out) {
        Ok(text) => println!("{}", text),
        Err(e) => {
            tracing::error!(target: logging::MAIN, "Cannot serialize report: {}", e);
            return ExitCode::FAILURE;
        }
    }
    status
}
