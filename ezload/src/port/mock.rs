use crate::error::{Error, Result};
use crate::port::ControlPort;

/// One control write seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Write {
    pub request: u8,
    pub address: u32,
    pub data: Vec<u8>,
}

/// Records every control write; can be told to fail selected calls.
#[derive(Default)]
pub(crate) struct MockPort {
    pub writes: Vec<Write>,
    fail_on: Vec<usize>,
    disconnect_on: Vec<usize>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the n-th call (0-based) with a transport error.
    pub fn failing_on(mut self, call: usize) -> Self {
        self.fail_on.push(call);
        self
    }

    /// Fail the n-th call (0-based) as if the device dropped off the bus.
    pub fn disconnecting_on(mut self, call: usize) -> Self {
        self.disconnect_on.push(call);
        self
    }

    pub fn calls(&self) -> usize {
        self.writes.len()
    }

    /// Writes that hit the given register.
    pub fn writes_to(&self, request: u8, address: u32) -> Vec<&Write> {
        self.writes
            .iter()
            .filter(|w| w.request == request && w.address == address)
            .collect()
    }
}

impl ControlPort for MockPort {
    fn control_write(&mut self, request: u8, address: u32, data: &[u8]) -> Result<()> {
        let call = self.writes.len();
        self.writes.push(Write {
            request,
            address,
            data: data.to_vec(),
        });

        if self.fail_on.contains(&call) {
            return Err(Error::Transport(format!("injected failure on call {call}")));
        }
        if self.disconnect_on.contains(&call) {
            return Err(Error::Disconnected);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
