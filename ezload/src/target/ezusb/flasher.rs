//! EZ-USB download engine.
//!
//! A download pass walks a small state machine:
//!
//! ```text
//! Idle -> ResetAsserted -> Transferring -> ResetReleased -> Done
//!   \__________________________|__________________________/
//!                              v
//!                           Failed
//! ```
//!
//! The CPU is held in reset (CPUCS) while on-chip RAM is written with the
//! `0xA0` request, then released so the new code runs. Once the CPU has been
//! halted or any transfer has started, the release write is always attempted,
//! even when the pass fails, so the device is not left stopped. The error
//! that caused the failure is the one returned.
//!
//! ## Two-stage loads
//!
//! A small second-stage loader (e.g. Cypress `Vend_Ax.hex`) is first loaded
//! into on-chip RAM. It implements the external-memory (`0xA3`) and EEPROM
//! (`0xA2`) requests, which the following pass uses to place firmware
//! outside on-chip RAM or into the boot EEPROM. The second pass talks to the
//! same handle; the device is never reopened.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ezload::{
//!     ChipFamily, Destination, DeviceIdentity, DownloadEngine, DownloadTarget, FirmwareImage,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let loader = FirmwareImage::from_file("Vend_Ax.hex")?;
//!     let firmware = FirmwareImage::from_file("firmware.hex")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut port = ezload::UsbPort::open(0x04B4, 0x8613)?;
//!         let identity = DeviceIdentity::from(port.info());
//!         let target = DownloadTarget::new(&mut port, *ChipFamily::Fx2Lp.profile(), identity);
//!
//!         DownloadEngine::new(target).load_two_stage(
//!             &loader,
//!             &firmware,
//!             Destination::Eeprom,
//!             Some(0x01),
//!             &mut |stage, current, total| println!("{stage}: {current}/{total}"),
//!         )?;
//!     }
//!
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::image::segment::{FirmwareImage, Segment};
use crate::port::{ControlPort, UsbDeviceInfo};
use crate::target::chip::{DeviceProfile, EEPROM_MAX_RECORD};
use crate::target::ezusb::protocol::{self, Chunk, RW_EEPROM, RW_INTERNAL, RW_MEMORY};
use log::{debug, info, trace, warn};

/// Byte written at EEPROM offset 0 to invalidate the boot header.
const EEPROM_NO_BOOT: u8 = 0x00;

/// Size of an EEPROM record header.
const EEPROM_RECORD_HEADER_LEN: u32 = 4;

/// State of the current download pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadState {
    /// Nothing sent yet.
    #[default]
    Idle,
    /// CPU is held in reset.
    ResetAsserted,
    /// Firmware chunks are being written.
    Transferring,
    /// CPU has been released.
    ResetReleased,
    /// Pass completed successfully.
    Done,
    /// Pass failed.
    Failed,
}

/// Where a pass writes the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Device RAM.
    Ram,
    /// Boot EEPROM, through a running second-stage loader.
    Eeprom,
}

/// Which RAM a RAM pass may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RamMode {
    /// On-chip RAM only; external addresses are rejected.
    #[default]
    InternalOnly,
    /// External memory through the loader first, then on-chip RAM.
    ExternalThenInternal,
}

/// USB identity written into an EEPROM boot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
    /// Device release number.
    pub bcd_device: u16,
}

impl From<&UsbDeviceInfo> for DeviceIdentity {
    fn from(info: &UsbDeviceInfo) -> Self {
        Self {
            vid: info.vid,
            pid: info.pid,
            bcd_device: info.bcd_device,
        }
    }
}

/// Description of a single pass.
#[derive(Debug, Clone, Copy)]
pub struct DownloadPlan<'a> {
    /// Firmware to write, in image order.
    pub segments: &'a [Segment],
    /// Where to write it.
    pub destination: Destination,
    /// EEPROM config byte (EEPROM passes only).
    pub config: Option<u8>,
    /// RAM write mode (RAM passes only).
    pub ram_mode: RamMode,
}

impl<'a> DownloadPlan<'a> {
    /// Plain on-chip RAM load with the CPU held in reset.
    pub fn ram(segments: &'a [Segment]) -> Self {
        Self {
            segments,
            destination: Destination::Ram,
            config: None,
            ram_mode: RamMode::InternalOnly,
        }
    }

    /// RAM load through a running loader, external memory included.
    pub fn second_stage_ram(segments: &'a [Segment]) -> Self {
        Self {
            ram_mode: RamMode::ExternalThenInternal,
            ..Self::ram(segments)
        }
    }

    /// Boot EEPROM load through a running loader.
    pub fn eeprom(segments: &'a [Segment], config: Option<u8>) -> Self {
        Self {
            segments,
            destination: Destination::Eeprom,
            config,
            ram_mode: RamMode::InternalOnly,
        }
    }

    /// Total number of firmware bytes in the plan.
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }
}

/// An open device paired with the profile used to drive it.
///
/// The port is borrowed: opening, claiming and closing it is the caller's
/// business.
pub struct DownloadTarget<'a, P: ControlPort + ?Sized> {
    port: &'a mut P,
    profile: DeviceProfile,
    identity: DeviceIdentity,
}

impl<'a, P: ControlPort + ?Sized> DownloadTarget<'a, P> {
    /// Pair a port with a device profile.
    pub fn new(port: &'a mut P, profile: DeviceProfile, identity: DeviceIdentity) -> Self {
        Self {
            port,
            profile,
            identity,
        }
    }

    /// Profile in use.
    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// USB identity of the device.
    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    /// Name of the underlying port.
    pub fn port_name(&self) -> &str {
        self.port.name()
    }
}

/// Drives download passes against one target.
pub struct DownloadEngine<'a, P: ControlPort + ?Sized> {
    target: DownloadTarget<'a, P>,
    state: DownloadState,
    reset_held: bool,
    release_error: Option<Error>,
    cancel_check: Option<Box<dyn Fn() -> bool + 'a>>,
}

impl<'a, P: ControlPort + ?Sized> DownloadEngine<'a, P> {
    /// Create an engine for the given target.
    pub fn new(target: DownloadTarget<'a, P>) -> Self {
        Self {
            target,
            state: DownloadState::Idle,
            reset_held: false,
            release_error: None,
            cancel_check: None,
        }
    }

    /// Install a check consulted before every transfer.
    ///
    /// When it returns `true` the pass fails with [`Error::Cancelled`],
    /// exactly like a transfer failure.
    #[must_use]
    pub fn with_cancel_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + 'a,
    {
        self.cancel_check = Some(Box::new(check));
        self
    }

    /// State reached by the last pass.
    pub fn state(&self) -> DownloadState {
        self.state
    }

    /// Error from a reset release attempted after a failed pass, if any.
    pub fn release_error(&self) -> Option<&Error> {
        self.release_error.as_ref()
    }

    /// Single-stage load of an image into on-chip RAM.
    pub fn load_ram(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        info!(
            "Single stage: loading {} bytes into on-chip RAM via {}",
            image.total_len(),
            self.target.port_name()
        );
        let plan = DownloadPlan::ram(image.segments());
        self.run_pass(&plan, &mut |current, total| {
            progress("firmware", current, total);
        })
    }

    /// Load a second-stage loader, then the firmware through it.
    ///
    /// Both plans are validated before anything is sent, so an impossible
    /// request (EEPROM on a part without one, unreachable addresses) never
    /// touches the device.
    pub fn load_two_stage(
        &mut self,
        loader: &FirmwareImage,
        firmware: &FirmwareImage,
        destination: Destination,
        config: Option<u8>,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        let loader_plan = DownloadPlan::ram(loader.segments());
        let firmware_plan = match destination {
            Destination::Ram => DownloadPlan::second_stage_ram(firmware.segments()),
            Destination::Eeprom => DownloadPlan::eeprom(firmware.segments(), config),
        };

        self.validate(&loader_plan)?;
        self.validate(&firmware_plan)?;

        info!("1st stage: loading 2nd stage loader");
        self.run_pass(&loader_plan, &mut |current, total| {
            progress("loader", current, total);
        })?;

        match destination {
            Destination::Ram => info!("2nd stage: loading firmware into RAM"),
            Destination::Eeprom => info!("2nd stage: writing firmware to EEPROM"),
        }
        self.run_pass(&firmware_plan, &mut |current, total| {
            progress("firmware", current, total);
        })
    }

    /// Check a plan against the profile without touching the device.
    pub fn validate(&self, plan: &DownloadPlan<'_>) -> Result<()> {
        let profile = &self.target.profile;

        if plan.destination == Destination::Eeprom && !profile.supports_eeprom {
            return Err(Error::UnsupportedOperation(format!(
                "{} does not support EEPROM programming",
                profile.family
            )));
        }

        let external_allowed = plan.destination == Destination::Ram
            && plan.ram_mode == RamMode::ExternalThenInternal;
        if !external_allowed {
            let limit = chunk_limit(profile, plan.destination);
            let chunks = protocol::split_segments(plan.segments, profile, limit);
            if let Some(chunk) = chunks.iter().find(|c| !c.internal) {
                return Err(Error::AddressOutOfRange {
                    address: chunk.address,
                    len: chunk.data.len(),
                });
            }
        }

        Ok(())
    }

    /// Run one pass.
    ///
    /// `progress` receives (bytes written, total bytes) after every chunk.
    pub fn run_pass(
        &mut self,
        plan: &DownloadPlan<'_>,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        self.state = DownloadState::Idle;
        self.reset_held = false;
        self.release_error = None;

        self.validate(plan)?;

        let outcome = match plan.destination {
            Destination::Ram => self.transfer_ram(plan, progress),
            Destination::Eeprom => self.transfer_eeprom(plan, progress),
        };
        self.finish(outcome)
    }

    fn transfer_ram(
        &mut self,
        plan: &DownloadPlan<'_>,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let profile = self.target.profile;
        let chunks = protocol::split_segments(
            plan.segments,
            &profile,
            chunk_limit(&profile, Destination::Ram),
        );
        let (internal, external): (Vec<Chunk<'_>>, Vec<Chunk<'_>>) =
            chunks.into_iter().partition(|c| c.internal);

        let total: usize = internal
            .iter()
            .chain(&external)
            .map(|c| c.data.len())
            .sum();
        let mut written = 0;

        // CPU keeps running the loader while external memory is written.
        if !external.is_empty() {
            debug!("Writing {} external chunk(s) through the loader", external.len());
            self.state = DownloadState::Transferring;
            for chunk in &external {
                self.write_chunk(RW_MEMORY, chunk)?;
                written += chunk.data.len();
                progress(written, total);
            }
        }

        self.assert_reset()?;
        self.state = DownloadState::Transferring;
        debug!("Writing {} on-chip chunk(s)", internal.len());
        for chunk in &internal {
            self.write_chunk(RW_INTERNAL, chunk)?;
            written += chunk.data.len();
            progress(written, total);
        }

        Ok(())
    }

    fn transfer_eeprom(
        &mut self,
        plan: &DownloadPlan<'_>,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let profile = self.target.profile;
        let identity = self.target.identity;
        let chunks = protocol::split_segments(
            plan.segments,
            &profile,
            chunk_limit(&profile, Destination::Eeprom),
        );

        let config = match plan.config {
            Some(config) if profile.eeprom_config_byte_supported => {
                let masked = config & profile.eeprom_config_mask;
                if masked != config {
                    warn!(
                        "{} ignores config bits 0x{:02X}",
                        profile.family,
                        config & !profile.eeprom_config_mask
                    );
                }
                masked
            },
            Some(config) => {
                warn!(
                    "{} has no EEPROM config byte, ignoring 0x{config:02X}",
                    profile.family
                );
                0
            },
            None => 0,
        };
        info!(
            "{}: EEPROM config = 0x{config:02X}, VID:PID {:04X}:{:04X}",
            profile.family, identity.vid, identity.pid
        );

        let total = plan.total_len();
        let mut written = 0;

        self.state = DownloadState::Transferring;

        // Make sure the EEPROM won't be used for booting if anything below fails.
        self.eeprom_write(0, &[EEPROM_NO_BOOT])?;

        let mut ee_addr = profile.eeprom_header_len() as u32;
        for chunk in &chunks {
            let header = protocol::eeprom_record_header(chunk.data.len(), chunk.address, false)?;
            self.check_cancelled()?;
            self.eeprom_write(ee_addr, &header)?;
            self.eeprom_write(ee_addr + EEPROM_RECORD_HEADER_LEN, chunk.data)?;
            ee_addr += EEPROM_RECORD_HEADER_LEN + chunk.data.len() as u32;

            written += chunk.data.len();
            progress(written, total);
        }

        // Last record: let the CPU run once the boot loader has copied everything.
        let header = protocol::eeprom_record_header(1, profile.reset_register_address, true)?;
        self.eeprom_write(ee_addr, &header)?;
        self.eeprom_write(
            ee_addr + EEPROM_RECORD_HEADER_LEN,
            &[profile.reset_release_value],
        )?;
        ee_addr += EEPROM_RECORD_HEADER_LEN + 1;

        let boot_header = protocol::eeprom_boot_header(
            &profile,
            identity.vid,
            identity.pid,
            identity.bcd_device,
            config,
        )?;
        self.eeprom_write(0, &boot_header)?;

        debug!("EEPROM image complete, {ee_addr} bytes used");
        Ok(())
    }

    fn finish(&mut self, outcome: Result<()>) -> Result<()> {
        let needs_release = self.reset_held || self.state == DownloadState::Transferring;

        match outcome {
            Ok(()) => {
                if needs_release {
                    if let Err(e) = self.release_reset() {
                        if !e.is_disconnect() {
                            self.state = DownloadState::Failed;
                            return Err(e);
                        }
                        debug!("Device re-enumerated on reset release: {e}");
                    }
                    self.state = DownloadState::ResetReleased;
                }
                self.state = DownloadState::Done;
                Ok(())
            },
            Err(err) => {
                if needs_release {
                    if let Err(e) = self.release_reset() {
                        warn!("Reset release after failed pass also failed: {e}");
                        self.release_error = Some(e);
                    }
                }
                self.state = DownloadState::Failed;
                Err(err)
            },
        }
    }

    fn assert_reset(&mut self) -> Result<()> {
        let profile = self.target.profile;
        debug!(
            "Holding CPU in reset (0x{:04X} <- 0x{:02X})",
            profile.reset_register_address, profile.reset_assert_value
        );
        // A failed write may still have halted the CPU.
        self.reset_held = true;
        self.target.port.control_write(
            RW_INTERNAL,
            profile.reset_register_address,
            &[profile.reset_assert_value],
        )?;
        self.state = DownloadState::ResetAsserted;
        Ok(())
    }

    fn release_reset(&mut self) -> Result<()> {
        let profile = self.target.profile;
        debug!(
            "Releasing CPU (0x{:04X} <- 0x{:02X})",
            profile.reset_register_address, profile.reset_release_value
        );
        self.target.port.control_write(
            RW_INTERNAL,
            profile.reset_register_address,
            &[profile.reset_release_value],
        )?;
        self.reset_held = false;
        Ok(())
    }

    fn write_chunk(&mut self, request: u8, chunk: &Chunk<'_>) -> Result<()> {
        self.check_cancelled()?;
        trace!(
            "Write 0x{request:02X}: {} bytes @ 0x{:04X}",
            chunk.data.len(),
            chunk.address
        );
        self.target
            .port
            .control_write(request, chunk.address, chunk.data)
    }

    fn eeprom_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        trace!("EEPROM write: {} bytes @ 0x{offset:04X}", data.len());
        self.target.port.control_write(RW_EEPROM, offset, data)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel_check.as_ref().is_some_and(|check| check()) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Largest chunk a pass may send to this profile.
fn chunk_limit(profile: &DeviceProfile, destination: Destination) -> usize {
    match destination {
        Destination::Ram => profile.max_chunk(),
        Destination::Eeprom => profile.max_chunk().min(EEPROM_MAX_RECORD),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;
    use crate::target::chip::{ChipFamily, CPUCS_FX2};

    const FX2_ID: DeviceIdentity = DeviceIdentity {
        vid: 0x04B4,
        pid: 0x8613,
        bcd_device: 0xA001,
    };

    fn fx2_with_chunk(chunk_size: usize) -> DeviceProfile {
        DeviceProfile {
            chunk_size,
            ..*ChipFamily::Fx2.profile()
        }
    }

    fn image(segments: Vec<Segment>) -> FirmwareImage {
        FirmwareImage::from_segments(segments)
    }

    fn no_progress() -> impl FnMut(&str, usize, usize) {
        |_, _, _| {}
    }

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_ram_pass_chunks_64_64_2() {
        init_logger();
        let mut port = MockPort::new();
        let fw = image(vec![Segment::new(0x0000, (0..130u8).collect())]);

        let mut engine =
            DownloadEngine::new(DownloadTarget::new(&mut port, fx2_with_chunk(64), FX2_ID));
        engine.load_ram(&fw, &mut no_progress()).unwrap();
        assert_eq!(engine.state(), DownloadState::Done);
        drop(engine);

        let writes = &port.writes;
        assert_eq!(writes.len(), 5);
        assert_eq!((writes[0].address, writes[0].data.clone()), (CPUCS_FX2, vec![0x01]));

        let data: Vec<(u32, usize)> = writes[1..4]
            .iter()
            .map(|w| {
                assert_eq!(w.request, RW_INTERNAL);
                (w.address, w.data.len())
            })
            .collect();
        assert_eq!(data, vec![(0x00, 64), (0x40, 64), (0x80, 2)]);
        assert_eq!(writes[3].data, vec![128, 129]);

        assert_eq!((writes[4].address, writes[4].data.clone()), (CPUCS_FX2, vec![0x00]));
    }

    #[test]
    fn test_progress_reports_every_chunk() {
        let mut port = MockPort::new();
        let fw = image(vec![Segment::new(0x0000, vec![0; 130])]);
        let mut seen = Vec::new();

        let mut engine =
            DownloadEngine::new(DownloadTarget::new(&mut port, fx2_with_chunk(64), FX2_ID));
        engine
            .load_ram(&fw, &mut |name: &str, current, total| {
                seen.push((name.to_string(), current, total));
            })
            .unwrap();

        assert_eq!(
            seen,
            vec![
                ("firmware".to_string(), 64, 130),
                ("firmware".to_string(), 128, 130),
                ("firmware".to_string(), 130, 130),
            ]
        );
    }

    #[test]
    fn test_failure_on_chunk_two_releases_once() {
        init_logger();
        // Call 0 asserts reset, calls 1..=3 are the chunks.
        let mut port = MockPort::new().failing_on(2);
        let fw = image(vec![Segment::new(0x0000, vec![0xAA; 130])]);

        let mut engine =
            DownloadEngine::new(DownloadTarget::new(&mut port, fx2_with_chunk(64), FX2_ID));
        let err = engine.load_ram(&fw, &mut no_progress()).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(engine.state(), DownloadState::Failed);
        assert!(engine.release_error().is_none());
        drop(engine);

        assert_eq!(port.calls(), 4);
        let releases: Vec<_> = port
            .writes_to(RW_INTERNAL, CPUCS_FX2)
            .into_iter()
            .filter(|w| w.data == [0x00])
            .collect();
        assert_eq!(releases.len(), 1);
        assert_eq!(port.writes.last().unwrap().data, vec![0x00]);
    }

    #[test]
    fn test_release_failure_does_not_mask_transfer_error() {
        let mut port = MockPort::new().failing_on(2).failing_on(3);
        let fw = image(vec![Segment::new(0x0000, vec![0xAA; 130])]);

        let mut engine =
            DownloadEngine::new(DownloadTarget::new(&mut port, fx2_with_chunk(64), FX2_ID));
        let err = engine.load_ram(&fw, &mut no_progress()).unwrap_err();
        assert!(err.to_string().contains("call 2"));
        assert!(engine.release_error().is_some());
        assert_eq!(engine.state(), DownloadState::Failed);
    }

    #[test]
    fn test_release_disconnect_is_tolerated() {
        let mut port = MockPort::new().disconnecting_on(2);
        let fw = image(vec![Segment::new(0x0000, vec![1, 2, 3])]);

        let mut engine =
            DownloadEngine::new(DownloadTarget::new(&mut port, *ChipFamily::Fx2.profile(), FX2_ID));
        engine.load_ram(&fw, &mut no_progress()).unwrap();
        assert_eq!(engine.state(), DownloadState::Done);
    }

    #[test]
    fn test_release_failure_after_success_fails_pass() {
        let mut port = MockPort::new().failing_on(2);
        let fw = image(vec![Segment::new(0x0000, vec![1, 2, 3])]);

        let mut engine =
            DownloadEngine::new(DownloadTarget::new(&mut port, *ChipFamily::Fx2.profile(), FX2_ID));
        assert!(engine.load_ram(&fw, &mut no_progress()).is_err());
        assert_eq!(engine.state(), DownloadState::Failed);
    }

    #[test]
    fn test_external_address_rejected_before_transfer() {
        let mut port = MockPort::new();
        let fw = image(vec![Segment::new(0x3000, vec![0; 16])]);

        let mut engine =
            DownloadEngine::new(DownloadTarget::new(&mut port, *ChipFamily::Fx2.profile(), FX2_ID));
        let err = engine.load_ram(&fw, &mut no_progress()).unwrap_err();
        assert!(matches!(
            err,
            Error::AddressOutOfRange {
                address: 0x3000,
                len: 16
            }
        ));
        assert_eq!(engine.state(), DownloadState::Idle);
        drop(engine);
        assert_eq!(port.calls(), 0);
    }

    #[test]
    fn test_eeprom_unsupported_issues_no_transfers() {
        let mut port = MockPort::new();
        let profile = DeviceProfile {
            supports_eeprom: false,
            ..*ChipFamily::Fx2.profile()
        };
        let loader = image(vec![Segment::new(0x0000, vec![0; 32])]);
        let fw = image(vec![Segment::new(0x0000, vec![0; 32])]);

        let mut engine = DownloadEngine::new(DownloadTarget::new(&mut port, profile, FX2_ID));
        let err = engine
            .load_two_stage(&loader, &fw, Destination::Eeprom, Some(0), &mut no_progress())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));

        let plan = DownloadPlan::eeprom(fw.segments(), None);
        assert!(matches!(
            engine.run_pass(&plan, &mut |_, _| {}),
            Err(Error::UnsupportedOperation(_))
        ));
        drop(engine);
        assert_eq!(port.calls(), 0);
    }

    #[test]
    fn test_two_stage_ram_writes_external_first() {
        let mut port = MockPort::new();
        let loader = image(vec![Segment::new(0x0000, vec![0x11; 8])]);
        let fw = image(vec![
            Segment::new(0x0000, vec![0x22; 4]),
            Segment::new(0x4000, vec![0x33; 4]),
        ]);

        let mut engine =
            DownloadEngine::new(DownloadTarget::new(&mut port, *ChipFamily::Fx2.profile(), FX2_ID));
        engine
            .load_two_stage(&loader, &fw, Destination::Ram, None, &mut no_progress())
            .unwrap();
        assert_eq!(engine.state(), DownloadState::Done);
        drop(engine);

        let summary: Vec<(u8, u32, Vec<u8>)> = port
            .writes
            .iter()
            .map(|w| (w.request, w.address, w.data.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                // loader pass
                (RW_INTERNAL, CPUCS_FX2, vec![0x01]),
                (RW_INTERNAL, 0x0000, vec![0x11; 8]),
                (RW_INTERNAL, CPUCS_FX2, vec![0x00]),
                // firmware pass
                (RW_MEMORY, 0x4000, vec![0x33; 4]),
                (RW_INTERNAL, CPUCS_FX2, vec![0x01]),
                (RW_INTERNAL, 0x0000, vec![0x22; 4]),
                (RW_INTERNAL, CPUCS_FX2, vec![0x00]),
            ]
        );
    }

    #[test]
    fn test_two_stage_eeprom_layout() {
        init_logger();
        let mut port = MockPort::new();
        let loader = image(vec![Segment::new(0x0000, vec![0x11; 4])]);
        let fw = image(vec![Segment::new(0x0100, vec![0xAB, 0xCD])]);

        let mut engine =
            DownloadEngine::new(DownloadTarget::new(&mut port, *ChipFamily::Fx2.profile(), FX2_ID));
        engine
            .load_two_stage(&loader, &fw, Destination::Eeprom, Some(0xFF), &mut no_progress())
            .unwrap();
        drop(engine);

        let eeprom: Vec<(u32, Vec<u8>)> = port
            .writes
            .iter()
            .filter(|w| w.request == RW_EEPROM)
            .map(|w| (w.address, w.data.clone()))
            .collect();
        assert_eq!(
            eeprom,
            vec![
                (0, vec![0x00]),
                (8, vec![0x00, 0x02, 0x01, 0x00]),
                (12, vec![0xAB, 0xCD]),
                (14, vec![0x80, 0x01, 0xE6, 0x00]),
                (18, vec![0x00]),
                (0, vec![0xC2, 0xB4, 0x04, 0x13, 0x86, 0x01, 0xA0, 0x4F]),
            ]
        );

        // EEPROM pass never halts the CPU; the loader keeps running.
        let asserts = port
            .writes
            .iter()
            .filter(|w| w.request == RW_INTERNAL && w.address == CPUCS_FX2 && w.data == [0x01])
            .count();
        assert_eq!(asserts, 1);
        assert_eq!(port.writes.last().unwrap().data, vec![0x00]);
    }

    #[test]
    fn test_loader_failure_skips_second_stage() {
        for destination in [Destination::Ram, Destination::Eeprom] {
            // Call 0 asserts reset, call 1 is the first loader chunk.
            let mut port = MockPort::new().failing_on(1);
            let loader = image(vec![Segment::new(0x0000, vec![0x11; 8])]);
            let fw = image(vec![Segment::new(0x0100, vec![0x22; 4])]);

            let mut engine = DownloadEngine::new(DownloadTarget::new(
                &mut port,
                *ChipFamily::Fx2.profile(),
                FX2_ID,
            ));
            let err = engine
                .load_two_stage(&loader, &fw, destination, Some(0x01), &mut no_progress())
                .unwrap_err();
            assert!(matches!(err, Error::Transport(_)), "{destination:?}");
            assert_eq!(engine.state(), DownloadState::Failed);
            assert!(engine.release_error().is_none());
            drop(engine);

            assert_eq!(port.calls(), 3, "{destination:?}");
            assert!(
                port.writes
                    .iter()
                    .all(|w| w.request != RW_MEMORY && w.request != RW_EEPROM)
            );
            let releases = port
                .writes
                .iter()
                .filter(|w| w.address == CPUCS_FX2 && w.data == [0x00])
                .count();
            assert_eq!(releases, 1);
        }
    }

    #[test]
    fn test_eeprom_rejects_external_addresses() {
        let mut port = MockPort::new();
        let fw = image(vec![Segment::new(0x8000, vec![0; 4])]);

        let mut engine =
            DownloadEngine::new(DownloadTarget::new(&mut port, *ChipFamily::Fx2.profile(), FX2_ID));
        let plan = DownloadPlan::eeprom(fw.segments(), Some(0));
        assert!(matches!(
            engine.run_pass(&plan, &mut |_, _| {}),
            Err(Error::AddressOutOfRange { .. })
        ));
        drop(engine);
        assert_eq!(port.calls(), 0);
    }

    #[test]
    fn test_cancel_fails_pass_and_releases() {
        let mut port = MockPort::new();
        let fw = image(vec![Segment::new(0x0000, vec![0; 16])]);

        let mut engine =
            DownloadEngine::new(DownloadTarget::new(&mut port, *ChipFamily::Fx2.profile(), FX2_ID))
                .with_cancel_check(|| true);
        let err = engine.load_ram(&fw, &mut no_progress()).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(engine.state(), DownloadState::Failed);
        drop(engine);

        // assert + release, no data
        assert_eq!(port.calls(), 2);
        assert_eq!(port.writes[1].data, vec![0x00]);
    }

    #[test]
    fn test_assert_failure_still_releases() {
        let mut port = MockPort::new().failing_on(0);
        let fw = image(vec![Segment::new(0x0000, vec![0; 16])]);

        let mut engine =
            DownloadEngine::new(DownloadTarget::new(&mut port, *ChipFamily::Fx2.profile(), FX2_ID));
        assert!(engine.load_ram(&fw, &mut no_progress()).is_err());
        assert_eq!(engine.state(), DownloadState::Failed);
        drop(engine);
        assert_eq!(port.calls(), 2);
    }
}
