use crate::{ChannelConfig, ControlStyle, DaqError, DaqResult};

/// Return codes reported by the digitizer driver.
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug)]
pub enum DeviceReturn {
    Success = 0,
    Generic = -1,
    InvalidParam = -2,
    DevAlreadyOpen = -3,
    DevNotFound = -4,
    Command = -6,
    Internal = -7,
    NotImplemented = -8,
    InvalidHandle = -9,
    Timeout = -11,
    Stop = -12,
    Disabled = -13,
    Comm = -15,
    Unknown = 1,
}

impl DeviceReturn {
    /// Turn a command return code into a `Result`, tagging failures with the command name.
    pub fn check(self, command: &'static str) -> DaqResult<()> {
        match self {
            DeviceReturn::Success => Ok(()),
            code => Err(DaqError::Device { command, code }),
        }
    }
}

/// The driver collaborator. Implementations perform the physical bus
/// transaction; the engine only sees filled byte buffers.
pub trait Digitizer {
    fn board_id(&self) -> usize;

    /// Largest number of bytes a single `read_data` call may transfer.
    fn buffer_size(&self) -> usize;

    /// Program the acquisition for the given channels and arm it. With
    /// `ControlStyle::ExternalGate` the board starts on its own once the gate
    /// arrives.
    fn arm(&mut self, style: ControlStyle, channels: &[ChannelConfig]) -> DeviceReturn;

    /// Software start command.
    fn start(&mut self) -> DeviceReturn;

    /// Stop and disarm.
    fn stop(&mut self) -> DeviceReturn;

    /// Blocking read bounded by the driver transfer timeout. Fills `buffer`
    /// and sets its filled size.
    fn read_data(&mut self, buffer: &mut ReadoutBuffer) -> DeviceReturn;
}

impl<D: Digitizer + ?Sized> Digitizer for Box<D> {
    fn board_id(&self) -> usize {
        (**self).board_id()
    }

    fn buffer_size(&self) -> usize {
        (**self).buffer_size()
    }

    fn arm(&mut self, style: ControlStyle, channels: &[ChannelConfig]) -> DeviceReturn {
        (**self).arm(style, channels)
    }

    fn start(&mut self) -> DeviceReturn {
        (**self).start()
    }

    fn stop(&mut self) -> DeviceReturn {
        (**self).stop()
    }

    fn read_data(&mut self, buffer: &mut ReadoutBuffer) -> DeviceReturn {
        (**self).read_data(buffer)
    }
}

/// Owned readout buffer handed to the driver each cycle.
///
/// The backing memory lives as long as the session keeps the buffer; it is
/// dropped at `stop`, so there is nothing to free by hand on early returns.
#[derive(Debug)]
pub struct ReadoutBuffer {
    data: Vec<u8>,
    filled: usize,
}

impl ReadoutBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// The bytes transferred in the last read.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn clear(&mut self) {
        self.filled = 0;
    }

    /// Copy `bytes` into the buffer, truncating at capacity. Returns the number of bytes stored.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.filled = n;
        n
    }
}
