pub mod classes;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod logging;
pub mod model_download;
pub mod pipeline;
pub mod recovery;
pub mod smoothing;
pub mod tester;
pub mod tts;
pub mod types;
#[cfg(feature = "desktop")]
pub mod ui;
pub mod web;
