use crate::{DeviceReturn, SessionState};
use thiserror::Error;

pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Debug, Error)]
pub enum DaqError {
    /// A device command returned something other than `Success`
    #[error("device command {command} failed: {code:?}")]
    Device {
        command: &'static str,
        code: DeviceReturn,
    },

    /// Operation not allowed in the current acquisition state
    #[error("cannot {op} while session is {state:?}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    #[error("calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("record sink error: {0}")]
    Sink(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a single event cannot be pulled out of a readout buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Nothing recorded for this index/channel in the current buffer
    #[error("no data")]
    NoData,

    #[error("malformed record on channel {channel}: {reason}")]
    Malformed { channel: usize, reason: String },
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("channel {0} has no calibration curve")]
    NoSuchChannel(usize),

    #[error("channel {channel} needs at least 2 distinct calibration points, has {points}")]
    InsufficientPoints { channel: usize, points: usize },

    #[error("point index {index} is past the end of channel {channel} ({size} points)")]
    IndexOutOfRange {
        channel: usize,
        index: usize,
        size: usize,
    },

    #[error("line {line}: cannot parse calibration point {content:?}")]
    Parse { line: usize, content: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
