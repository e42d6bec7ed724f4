pub mod three_bar;
pub mod signal_service;

pub use signal_service::{ThreeBarConfig, ThreeBarStrategy};
