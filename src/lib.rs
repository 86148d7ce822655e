//! Acquisition and online pulse shape analysis for multi-channel waveform
//! digitizers.
//!
//! An [`AcquisitionSession`] drives a [`Digitizer`] through
//! arm/start/read/stop, decodes each readout buffer into per-channel events,
//! analyses them, fills energy spectra and PSD histograms, and hands the
//! selected fields of every event to a [`RecordSink`].

pub mod analyzer;
pub mod calibration;
pub mod config;
pub mod decoder;
pub mod device;
pub mod error;
pub mod export;
pub mod histogram;
pub mod session;
pub mod simulator;
pub mod timestamp;
pub mod tui;
pub mod utils;
pub mod writer;
pub mod zle;

pub use analyzer::*;
pub use calibration::*;
pub use config::*;
pub use decoder::{
    decoder_for, DeviceFeatures, FeatureDecoder, FeatureEvent, RawEvent, RecordDecoder,
    RecordHeader, WaveformDecoder, HEADER_WORDS,
};
pub use device::*;
pub use error::*;
pub use export::*;
pub use histogram::*;
pub use session::*;
pub use simulator::*;
pub use timestamp::TimestampNormalizer;
pub use tui::{Status, StatusExit};
pub use utils::Counter;
pub use writer::*;
pub use zle::SparseDecoder;
