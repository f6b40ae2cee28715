pub mod core;
pub mod escalations;
pub mod interventions;
pub mod metrics;
pub mod notifications;
pub mod records;
pub mod setup;
