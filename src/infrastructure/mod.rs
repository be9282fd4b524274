pub mod logging;
pub mod simulated;
pub mod transport;
#[cfg(windows)]
pub mod winrt;
