//! Synthetic telemetry used once the device is given up on.
//!
//! Reports jitter around a fixed campus coordinate and have the same shape as
//! live ones, so subscribers cannot tell the two apart.

use std::time::Duration;

use chrono::Utc;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::{FrameError, OperationalStatus, Position, ReportFields, TelemetryReport};

pub const DEFAULT_SIMULATION_INTERVAL: Duration = Duration::from_millis(3000);
pub const CAMPUS_BASE: Position = Position {
    lat: 16.4325,
    lng: 103.3660,
};
pub const POSITION_JITTER_DEG: f64 = 0.0005;
pub const AWAITING_PROBABILITY: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub interval: Duration,
    pub vehicle_id: u32,
    pub base: Position,
    /// Fixed seed for reproducible runs; entropy-seeded when unset.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SIMULATION_INTERVAL,
            vehicle_id: 1,
            base: CAMPUS_BASE,
            seed: None,
        }
    }
}

pub struct SyntheticGenerator {
    vehicle_id: u32,
    base: Position,
    rng: StdRng,
}

impl SyntheticGenerator {
    pub fn new(config: &SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            vehicle_id: config.vehicle_id,
            base: config.base,
            rng,
        }
    }

    pub fn next_report(&mut self) -> Result<TelemetryReport, FrameError> {
        let lat = self.base.lat + self.rng.gen_range(-POSITION_JITTER_DEG..=POSITION_JITTER_DEG);
        let lng = self.base.lng + self.rng.gen_range(-POSITION_JITTER_DEG..=POSITION_JITTER_DEG);
        let status = if self.rng.gen_bool(AWAITING_PROBABILITY) {
            OperationalStatus::AwaitingPassengers
        } else {
            OperationalStatus::Running
        };

        TelemetryReport::new(ReportFields {
            vehicle_id: self.vehicle_id,
            position: Position::new(lat.clamp(-90.0, 90.0), lng.clamp(-180.0, 180.0))?,
            status,
            passenger_count: self.rng.gen_range(5..=29),
            speed_kph: f64::from(self.rng.gen_range(10u32..=49)),
            battery_percent: self.rng.gen_range(70..=99),
            gps_valid: Some(true),
            timestamp: u64::try_from(Utc::now().timestamp_millis()).ok(),
        })
    }
}

/// Emits one synthetic report per tick through `publish`, which returns how
/// many subscribers took it. Stops once `publish` returns `None`.
pub async fn run<P>(config: SimulationConfig, publish: P)
where
    P: Fn(&TelemetryReport) -> Option<usize>,
{
    let mut generator = SyntheticGenerator::new(&config);
    let period = config.interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        interval_ms = period.as_millis() as u64,
        vehicle_id = config.vehicle_id,
        "synthetic telemetry started"
    );

    loop {
        ticker.tick().await;
        match generator.next_report() {
            Ok(report) => match publish(&report) {
                Some(delivered) => debug!(delivered, "synthetic report published"),
                None => {
                    debug!("synthetic telemetry publisher closed");
                    return;
                }
            },
            Err(err) => warn!(%err, "synthetic report rejected"),
        }
    }
}
