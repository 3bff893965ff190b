//! Environment readiness check.

use crate::cli::output;
use crate::config::{HarvestConfig, StoreTarget};
use crate::harvest::resources::{existing_ancestor, ResourceProbe, SystemProbe};
use crate::renderer::chromium::find_chromium;
use crate::store::open_store;
use anyhow::Result;
use serde_json::json;

/// Check the browser binary, the store, the state directory and host
/// resources.
pub async fn run() -> Result<()> {
    let config = match HarvestConfig::from_env().and_then(|c| c.validate().map(|()| c)) {
        Ok(config) => Ok(config),
        Err(e) => Err(e.to_string()),
    };

    let chromium = find_chromium(config.as_ref().ok().and_then(|c| c.chromium_path.as_deref()));

    let store = match &config {
        Ok(c) => match open_store(c) {
            Ok(store) => store.ping().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        },
        Err(e) => Err(format!("configuration invalid: {e}")),
    };
    let store_label = match config.as_ref().ok().and_then(|c| c.store.as_ref()) {
        Some(StoreTarget::Rest { url, .. }) => url.clone(),
        Some(StoreTarget::Sqlite(path)) => path.display().to_string(),
        None => "none".to_string(),
    };

    let state_dir = config
        .as_ref()
        .map(|c| c.state_dir.clone())
        .unwrap_or_else(|_| dirs::home_dir().unwrap_or_default().join(".harvest"));
    let sample = SystemProbe::new(existing_ancestor(&state_dir)).sample();
    let (mem_limit, disk_limit) = config
        .as_ref()
        .map(|c| (c.memory_limit_pct, c.disk_limit_pct))
        .unwrap_or((90.0, 90.0));
    let pressure_ok = !sample.constrained(mem_limit, disk_limit);

    let ready = config.is_ok() && chromium.is_some() && store.is_ok();

    if output::is_json() {
        output::print_json(&json!({
            "ready": ready,
            "config": config.as_ref().err(),
            "chromium": chromium.as_ref().map(|p| p.display().to_string()),
            "store": { "target": store_label, "error": store.as_ref().err() },
            "state_dir": state_dir.display().to_string(),
            "memory_used_pct": sample.memory_used_pct,
            "disk_used_pct": sample.disk_used_pct,
            "resources_ok": pressure_ok,
        }));
        return Ok(());
    }

    println!("Harvest Doctor");
    println!("==============");
    println!();
    println!("OS:   {}", std::env::consts::OS);
    println!("Arch: {}", std::env::consts::ARCH);
    println!();

    match &config {
        Ok(_) => output::check_line(Some(true), "Configuration valid"),
        Err(e) => output::check_line(Some(false), &format!("Configuration invalid: {e}")),
    }
    match &chromium {
        Some(path) => {
            output::check_line(Some(true), &format!("Chromium found: {}", path.display()))
        }
        None => output::check_line(
            Some(false),
            "Chromium NOT found. Set HARVEST_CHROMIUM_PATH or install google-chrome/chromium.",
        ),
    }
    match &store {
        Ok(()) => output::check_line(Some(true), &format!("Store reachable: {store_label}")),
        Err(e) => output::check_line(Some(false), &format!("Store {store_label}: {e}")),
    }
    output::check_line(
        Some(state_dir.exists()),
        &format!("State directory: {}", state_dir.display()),
    );
    match sample.memory_used_pct {
        Some(pct) => output::check_line(
            Some(pct <= mem_limit),
            &format!("Memory in use: {pct:.0}% (limit {mem_limit:.0}%)"),
        ),
        None => output::check_line(None, "Could not determine memory usage"),
    }
    match sample.disk_used_pct {
        Some(pct) => output::check_line(
            Some(pct <= disk_limit),
            &format!("Disk in use: {pct:.0}% (limit {disk_limit:.0}%)"),
        ),
        None => output::check_line(None, "Could not determine disk usage"),
    }

    println!();
    if ready {
        println!("Status: READY");
    } else {
        println!("Status: NOT READY");
    }
    Ok(())
}
