//! EZ-USB download support.

pub mod flasher;
pub mod protocol;
