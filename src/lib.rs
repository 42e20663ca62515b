pub mod client;
pub mod config;
pub mod domain;
pub mod link;
pub mod registry;
pub mod server;
pub mod simulator;

pub use client::{ClientConfig, ConnectionPhase, Mode, TelemetryClient};
pub use domain::{DeviceCommand, OperationalStatus, Position, TelemetryReport};
pub use registry::{ReportStream, Subscription};
