#![warn(clippy::unwrap_used)]

pub mod config;
pub mod context;
pub mod error;
pub mod event_sink;
pub mod targeting;
pub mod types;

pub use config::AppConfig;
pub use context::{GeoResolver, NoGeoResolver, RequestMeta, VisitorContext};
pub use error::{AdServeError, AdServeResult};
pub use event_sink::{CaptureSink, DeliverySink, NoOpSink};
pub use targeting::{TargetingMatch, TargetingRules};
