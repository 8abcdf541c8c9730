//! BLE serial relay library
//! A serial console over BLE UART modules, with session sharing so a remote
//! support operator can watch the device output and send commands to it.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod relay;
pub mod state;
pub mod utils;
