// Live "recently seen" view of advertising peripherals
//
// Every advertisement refreshes the device's entry; devices that stay silent
// for longer than the TTL age out of the registry.

use crate::radio::{peripheral_address, BtleplugRadio};
use anyhow::{Context, Result};
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use chrono::Local;
use colored::*;
use futures::StreamExt;
use gattlink_core::{DeviceAddress, ExpiringRegistry, RegistryListener};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl Sighting {
    fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", self.address, name),
            None => self.address.to_string(),
        }
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

struct Printer;

impl RegistryListener<Sighting> for Printer {
    fn on_item_added(&self, _key: u64, _index: usize, value: &Sighting) {
        let rssi = value
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "? dBm".to_string());
        println!(
            "{} {} {} {}",
            timestamp().dimmed(),
            "+".bright_green(),
            value.label().bright_cyan(),
            rssi.dimmed()
        );
    }

    fn on_item_updated(&self, _key: u64, _index: usize, value: &Sighting) {
        debug!("Refreshed {}", value.label());
    }

    fn on_item_removed(
        &self,
        _key: u64,
        _index: usize,
        value: &Sighting,
        ttl: Duration,
        expired: bool,
    ) {
        if expired {
            println!(
                "{} {} {} {}",
                timestamp().dimmed(),
                "-".bright_red(),
                value.label(),
                format!("(silent for {:?})", ttl).dimmed()
            );
        }
    }
}

/// Scan for `duration` (or until Ctrl-C) and print arrivals and departures
pub async fn run(radio: &BtleplugRadio, duration: Duration, ttl: Duration) -> Result<()> {
    let registry: ExpiringRegistry<Sighting> = ExpiringRegistry::new("watch", ttl)?;
    registry.add_listener(Arc::new(Printer));

    let adapter = radio.adapter();
    let mut events = adapter
        .events()
        .await
        .context("Failed to subscribe to adapter events")?;
    adapter
        .start_scan(ScanFilter::default())
        .await
        .context("Failed to start scan")?;
    println!(
        "{} for {:?}, forgetting devices after {:?} of silence",
        "Watching".bold(),
        duration,
        ttl
    );

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.next() => match event {
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                    let peripheral = match adapter.peripheral(&id).await {
                        Ok(peripheral) => peripheral,
                        Err(e) => {
                            debug!("Peripheral lookup failed: {}", e);
                            continue;
                        }
                    };
                    let Some(address) = peripheral_address(&peripheral) else {
                        continue;
                    };
                    let properties = peripheral.properties().await.ok().flatten();
                    registry.put(
                        address.as_u64(),
                        Sighting {
                            address,
                            name: properties.as_ref().and_then(|p| p.local_name.clone()),
                            rssi: properties.as_ref().and_then(|p| p.rssi),
                        },
                    );
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    if let Err(e) = adapter.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }
    registry.stop();

    println!();
    println!("{} ({} in view)", "Recently seen".bold(), registry.len());
    for sighting in registry.values() {
        let remaining = registry
            .remaining(sighting.address.as_u64())
            .unwrap_or_default();
        println!(
            "  {} {} {}",
            "•".bright_green(),
            sighting.label().bright_cyan(),
            format!("(expires in {}s)", remaining.as_secs()).dimmed()
        );
    }
    Ok(())
}
