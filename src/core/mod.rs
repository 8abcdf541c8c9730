//! Core functionality for the BLE serial relay
//! The device link, the line framer and the event plumbing they share.

pub mod bluetooth;
pub mod events;
pub mod framer;

// Re-export commonly used types
pub use bluetooth::{DeviceLink, ErrorKind, LinkError, LinkEvent, LinkState};
pub use events::{EventBus, Subscription};
pub use framer::LineFramer;
