//! Target chip support.

pub mod chip;
pub mod ezusb;

pub use chip::{ChipFamily, DeviceProfile};
