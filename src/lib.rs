mod ort_detector;
mod routes;
mod server;
mod stream;

pub mod accuracy;
pub mod app;
pub mod config;
pub mod detection;
pub mod frame;
pub mod pipeline;
pub mod telemetry;
pub mod video;

pub use app::start_app;
