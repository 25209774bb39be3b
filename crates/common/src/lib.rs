//! Common utilities for vmusb
//!
//! Shared leaves of the passthrough stack: error handling, logging setup,
//! the core notification channel, the usb.ids hardware database, tiered
//! device-identity resolution, and the narrow contract over the persisted
//! desired-passthrough list.

pub mod error;
pub mod events;
pub mod identity;
pub mod logging;
pub mod store;
pub mod usb_ids;

pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus};
pub use identity::{
    DescriptorProbe, DeviceIdentity, DeviceStrings, IdentityResolver, LsusbProbe,
    format_description,
};
pub use logging::setup_logging;
pub use store::{DesiredStateStore, JsonFileStore, MemoryStore, PassthroughEntry};
pub use usb_ids::UsbIdDatabase;
