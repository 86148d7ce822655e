use crate::{
    decoder::{encode_feature_aggregate, encode_record, encode_waveform_record, words_to_bytes},
    timestamp::COUNTER_MASK,
    zle::encode_block,
    ChannelConfig, ControlStyle, DeviceFeatures, DeviceReturn, Digitizer, FeatureEvent,
    OperatingMode, Polarity, ReadoutBuffer, ZeroSuppressionEdge, ZleSettings,
};
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{thread, time::Duration};

const ADC_MAX: f64 = 16383.0;
const RISE_TIME: f64 = 2.0;
const FAST_DECAY: f64 = 6.0;
const SLOW_DECAY: f64 = 60.0;

/// Digitizer stand-in that synthesises scintillator pulses in the readout
/// format selected at construction.
///
/// Pulses are a fast and a slow exponential component. About a third of them
/// carry a larger slow fraction, so PSD plots show two bands.
#[derive(Debug)]
pub struct SimulatedDigitizer {
    board_id: usize,
    mode: OperatingMode,
    zle: bool,
    traces: bool,
    rng: StdRng,
    channels: Vec<ChannelConfig>,
    armed: bool,
    running: bool,
    records_per_read: usize,
    read_interval: Duration,
    max_reads: Option<usize>,
    reads: usize,
    time_tag: u32,
    counter: u32,
    buffer_size: usize,
}

impl SimulatedDigitizer {
    pub fn new(board_id: usize, mode: OperatingMode, seed: u64) -> Self {
        Self {
            board_id,
            mode,
            zle: false,
            traces: false,
            rng: StdRng::seed_from_u64(seed),
            channels: Vec::new(),
            armed: false,
            running: false,
            records_per_read: 16,
            read_interval: Duration::ZERO,
            max_reads: None,
            reads: 0,
            time_tag: 0,
            counter: 0,
            buffer_size: 4 << 20,
        }
    }

    /// Zero-length encode Full-Waveform records.
    pub fn with_zle(mut self, zle: bool) -> Self {
        self.zle = zle;
        self
    }

    /// Embed traces in Feature-List records.
    pub fn with_traces(mut self, traces: bool) -> Self {
        self.traces = traces;
        self
    }

    pub fn with_records_per_read(mut self, n: usize) -> Self {
        self.records_per_read = n.max(1);
        self
    }

    /// Time each read takes, standing in for the driver transfer.
    pub fn with_read_interval(mut self, interval: Duration) -> Self {
        self.read_interval = interval;
        self
    }

    /// Report `Stop` after `n` data reads.
    pub fn with_max_reads(mut self, n: Option<usize>) -> Self {
        self.max_reads = n;
        self
    }

    pub fn with_start_time_tag(mut self, time_tag: u32) -> Self {
        self.time_tag = time_tag & COUNTER_MASK;
        self
    }

    pub fn reads(&self) -> usize {
        self.reads
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn next_time_tag(&mut self) -> u32 {
        let step = self.rng.random_range(1_000..50_000);
        self.time_tag = self.time_tag.wrapping_add(step) & COUNTER_MASK;
        self.time_tag
    }

    fn pulse(&mut self, channel: &ChannelConfig) -> Vec<u16> {
        let (baseline, sign) = match channel.polarity {
            Polarity::Positive => (1000.0, 1.0),
            Polarity::Negative => (15000.0, -1.0),
        };
        let amplitude = self.rng.random_range(200.0..3000.0);
        let slow_fraction = if self.rng.random_bool(0.3) { 0.35 } else { 0.1 };
        (0..channel.record_length)
            .map(|i| {
                let t = i as f64 - channel.pre_trigger as f64;
                let shape = if t < 0.0 {
                    0.0
                } else {
                    let decay = (1.0 - slow_fraction) * (-t / FAST_DECAY).exp()
                        + slow_fraction * (-t / SLOW_DECAY).exp();
                    decay * (1.0 - (-t / RISE_TIME).exp())
                };
                let noise = self.rng.random_range(-2.0..=2.0);
                (baseline + sign * amplitude * shape + noise).clamp(0.0, ADC_MAX) as u16
            })
            .collect()
    }

    /// Features the firmware would compute for `samples`.
    fn features(channel: &ChannelConfig, samples: &[u16]) -> DeviceFeatures {
        if samples.is_empty() {
            return DeviceFeatures::default();
        }
        let pre = channel.pre_trigger.min(samples.len()).max(1);
        let base = samples[..pre].iter().map(|&s| s as f64).sum::<f64>() / pre as f64;
        let sign = channel.polarity.sign();
        let corrected: Vec<f64> = samples
            .iter()
            .map(|&s| (sign * (s as f64 - base)).max(0.0))
            .collect();
        let gate = |start: i64, stop: i64| {
            let from = (pre as i64 + start).clamp(0, corrected.len() as i64) as usize;
            let to = (pre as i64 + stop).clamp(from as i64, corrected.len() as i64) as usize;
            corrected[from..to].iter().sum::<f64>()
        };
        let q_long = gate(channel.psd_total.start, channel.psd_total.stop) / 16.0;
        let q_short = (q_long - gate(channel.psd_tail.start, channel.psd_tail.stop) / 16.0).max(0.0);
        DeviceFeatures {
            baseline: base as u16,
            height: corrected.iter().copied().fold(0.0, f64::max) as u16,
            q_long: q_long.min(u16::MAX as f64) as u16,
            q_short: q_short.min(0x7FFF as f64) as u16,
            pileup: false,
        }
    }

    fn zle_settings(channel: &ChannelConfig) -> ZleSettings {
        channel.zle.unwrap_or(ZleSettings {
            threshold: 0,
            look_back: 0,
            look_forward: 0,
            edge: ZeroSuppressionEdge::Rise,
        })
    }

    fn waveform_records(&mut self) -> Vec<u32> {
        let channels = self.channels.clone();
        let mut words = Vec::new();
        for _ in 0..self.records_per_read {
            let tag = self.next_time_tag();
            let traces: Vec<(usize, Vec<u16>)> = channels
                .iter()
                .map(|ch| (ch.channel, self.pulse(ch)))
                .collect();
            let record = if self.zle {
                let blocks: Vec<(usize, Vec<u32>)> = channels
                    .iter()
                    .zip(&traces)
                    .map(|(ch, (_, samples))| {
                        (ch.channel, encode_block(samples, &Self::zle_settings(ch)))
                    })
                    .collect();
                encode_record(self.board_id, self.counter, tag, &blocks)
            } else {
                encode_waveform_record(self.board_id, self.counter, tag, &traces)
            };
            words.extend(record);
            self.counter = self.counter.wrapping_add(1);
        }
        words
    }

    fn feature_aggregate(&mut self) -> Vec<u32> {
        let channels = self.channels.clone();
        let blocks: Vec<(usize, Vec<FeatureEvent>)> = channels
            .iter()
            .map(|ch| {
                let events = (0..self.records_per_read)
                    .map(|_| {
                        let samples = self.pulse(ch);
                        FeatureEvent {
                            time_tag: self.next_time_tag(),
                            features: Self::features(ch, &samples),
                            trace: self.traces.then_some(samples),
                        }
                    })
                    .collect();
                (ch.channel, events)
            })
            .collect();
        let tag = self.time_tag;
        let aggregate = encode_feature_aggregate(self.board_id, self.counter, tag, &blocks);
        self.counter = self.counter.wrapping_add(1);
        aggregate
    }
}

impl Digitizer for SimulatedDigitizer {
    fn board_id(&self) -> usize {
        self.board_id
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn arm(&mut self, style: ControlStyle, channels: &[ChannelConfig]) -> DeviceReturn {
        if channels.is_empty() {
            return DeviceReturn::InvalidParam;
        }
        self.channels = channels.to_vec();
        self.armed = true;
        self.reads = 0;
        // The simulated gate is always present.
        self.running = style == ControlStyle::ExternalGate;
        debug!(
            "simulated board {} armed with {} channels",
            self.board_id,
            channels.len()
        );
        DeviceReturn::Success
    }

    fn start(&mut self) -> DeviceReturn {
        if !self.armed {
            return DeviceReturn::Command;
        }
        self.running = true;
        DeviceReturn::Success
    }

    fn stop(&mut self) -> DeviceReturn {
        self.armed = false;
        self.running = false;
        DeviceReturn::Success
    }

    fn read_data(&mut self, buffer: &mut ReadoutBuffer) -> DeviceReturn {
        if !self.read_interval.is_zero() {
            thread::sleep(self.read_interval);
        }
        if !self.running {
            return DeviceReturn::Timeout;
        }
        if self.max_reads.is_some_and(|max| self.reads >= max) {
            return DeviceReturn::Stop;
        }
        let words = match self.mode {
            OperatingMode::FullWaveform => self.waveform_records(),
            OperatingMode::FeatureList => self.feature_aggregate(),
        };
        buffer.fill_from(&words_to_bytes(&words));
        self.reads += 1;
        DeviceReturn::Success
    }
}
