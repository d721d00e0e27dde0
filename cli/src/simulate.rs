// Scripted roaming demo over loopback radios
//
// Three radios, two peers. The peers move between radios while the pool
// follows them; every coordinator event is printed as it happens. The
// sensor is a heart rate monitor, so its readings keep arriving across
// handoffs.

use anyhow::{Context, Result};
use colored::*;
use roampool_core::transport::ble::advertisement::{Advertisement, ServiceUuid};
use roampool_core::transport::ble::gatt::HEART_RATE_MEASUREMENT;
use roampool_core::transport::{Airspace, PeerId, Transport};
use roampool_core::{BondingStore, RoamingConfig, RoamingNetwork};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

struct Move {
    note: &'static str,
    peer: PeerId,
    rssi: [Option<i8>; 3],
}

fn scale(ms: u64, speed: f64) -> u64 {
    ((ms as f64 / speed).round() as u64).max(1)
}

/// Heart Rate Measurement value in the one-byte format
fn heartbeat(tick: u64) -> Vec<u8> {
    vec![0x00, 68 + (tick % 12) as u8]
}

fn demo_config(speed: f64) -> RoamingConfig {
    RoamingConfig {
        scan_period_ms: scale(4_000, speed),
        scan_duration_ms: scale(800, speed),
        rssi_period_ms: scale(1_000, speed),
        analysis_duration_ms: scale(800, speed),
        connect_timeout_ms: scale(1_500, speed),
        boot_timeout_ms: scale(1_000, speed),
        handoff_margin_db: 3,
        rssi_disconnect_dbm: -95,
        ..RoamingConfig::default()
    }
}

pub async fn run(speed: f64) -> Result<()> {
    if !(speed.is_finite() && speed > 0.0) {
        anyhow::bail!("Speed must be a positive number, got {}", speed);
    }

    let sensor = PeerId::public([0xE0, 0x5E, 0x45, 0x00, 0x00, 0x01]);
    let badge = PeerId::public([0xE0, 0xBA, 0xD6, 0x00, 0x00, 0x02]);
    let radios = ["r0", "r1", "r2"];

    let air = Airspace::new();
    air.add_peer(sensor, Advertisement::from_services(vec![ServiceUuid::HEART_RATE]));
    air.add_gatt_service(sensor, ServiceUuid::HEART_RATE, &[HEART_RATE_MEASUREMENT]);
    air.add_peer(badge, Advertisement::default());

    let script = [
        Move {
            note: "sensor sits next to r0",
            peer: sensor,
            rssi: [Some(-48), Some(-82), None],
        },
        Move {
            note: "badge appears near r1",
            peer: badge,
            rssi: [Some(-85), Some(-55), Some(-88)],
        },
        Move {
            note: "sensor drifts towards r1",
            peer: sensor,
            rssi: [Some(-84), Some(-66), Some(-79)],
        },
        Move {
            note: "sensor reaches r2",
            peer: sensor,
            rssi: [None, Some(-86), Some(-52)],
        },
        Move {
            note: "badge leaves the building",
            peer: badge,
            rssi: [None, None, None],
        },
    ];

    let transports: Vec<Box<dyn Transport>> = radios
        .iter()
        .map(|name| Box::new(air.radio(*name)) as Box<dyn Transport>)
        .collect();
    let network = RoamingNetwork::start(demo_config(speed), transports, BondingStore::in_memory())
        .context("Failed to start simulated pool")?;

    let mut events = network.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => crate::print_event(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let monitor = air.clone();
    let beat = Duration::from_millis(scale(3_000, speed));
    let heart = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(beat);
        for tick in 0.. {
            ticker.tick().await;
            // Dropped while the sensor is between radios
            monitor.notify_value(sensor, HEART_RATE_MEASUREMENT, heartbeat(tick));
        }
    });

    println!("{}", "Roaming simulation".bold());
    println!("  Radios: {}", radios.join(", ").bright_cyan());
    println!("  Peers:  {} (sensor), {} (badge)", sensor, badge);
    println!();

    let pause = Duration::from_millis(scale(9_000, speed));
    for step in &script {
        println!("{} {}", "▶".bright_magenta(), step.note.bold());
        for (radio, rssi) in radios.iter().zip(step.rssi) {
            air.set_rssi(step.peer, radio, rssi);
        }
        if step.rssi.iter().all(Option::is_none) {
            air.drop_link(step.peer);
        }
        tokio::time::sleep(pause).await;
    }

    let coordinator = network.shutdown().await.context("Failed to stop simulated pool")?;
    heart.abort();
    printer.abort();

    println!();
    println!("{}", "Final topology".bold());
    println!("  {}", coordinator.topology());
    println!(
        "  {} bond(s); sensor paired {} time(s)",
        coordinator.bonds().len(),
        air.pairing_count(&sensor)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_config_is_valid_at_any_speed() {
        for speed in [0.25, 1.0, 4.0, 1000.0] {
            demo_config(speed).validate().unwrap();
        }
        assert_eq!(scale(1_000, 2.0), 500);
        assert_eq!(scale(1, 1000.0), 1);
    }

    #[test]
    fn test_heartbeat_stays_in_resting_range() {
        assert_eq!(heartbeat(0), vec![0x00, 68]);
        assert_eq!(heartbeat(11), vec![0x00, 79]);
        assert_eq!(heartbeat(12), heartbeat(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_runs_to_completion() {
        run(10.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_bad_speed() {
        assert!(run(0.0).await.is_err());
        assert!(run(f64::NAN).await.is_err());
    }
}
