#![warn(clippy::unwrap_used)]

pub mod logger;

pub use logger::{AnalyticsLogger, DeliveryRow};
