#![warn(clippy::pedantic)]
// Don't care enough to fix
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::wildcard_imports)]

pub mod audit;
pub mod classifier;
pub mod dispatch;
pub mod metrics;
pub mod normalise;
pub mod policy;
pub mod server;
pub mod settings;
pub mod synthesise;
