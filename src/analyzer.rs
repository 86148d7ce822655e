use crate::{
    ChannelConfig, DeviceFeatures, GateWindow, OperatingMode, RawEvent, SampleWindow,
    SpectrumQuantity,
};
use std::ops::Range;

/// Calibrated counterparts of the pulse height and area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibratedValues {
    pub height: f64,
    pub area: f64,
}

/// Pulse features of one channel event.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzedEvent {
    pub board_id: usize,
    pub channel: usize,
    pub baseline: f64,
    /// Sample index of the pulse maximum; `None` when no trace was analysed.
    pub peak_position: Option<usize>,
    pub height: f64,
    pub area: f64,
    pub psd_total: f64,
    pub psd_tail: f64,
    /// Rollover-corrected trigger time tag.
    pub timestamp: u64,
    pub calibrated: Option<CalibratedValues>,
}

impl AnalyzedEvent {
    /// The value histogrammed for `quantity`, calibrated when a calibration is active.
    pub fn spectrum_value(&self, quantity: SpectrumQuantity) -> f64 {
        match (quantity, self.calibrated) {
            (SpectrumQuantity::PulseHeight, Some(cal)) => cal.height,
            (SpectrumQuantity::PulseArea, Some(cal)) => cal.area,
            (SpectrumQuantity::PulseHeight, None) => self.height,
            (SpectrumQuantity::PulseArea, None) => self.area,
        }
    }
}

/// Mode-specific feature extraction, selected once per run.
pub trait PulseAnalyzer {
    fn analyze(&self, event: &RawEvent, channel: &ChannelConfig) -> AnalyzedEvent;
}

pub fn analyzer_for(mode: OperatingMode, channels: &[ChannelConfig]) -> Box<dyn PulseAnalyzer> {
    match mode {
        OperatingMode::FullWaveform => Box::new(FullWaveformAnalyzer::new(channels)),
        OperatingMode::FeatureList => Box::new(FeatureListAnalyzer::new(channels)),
    }
}

/// Mean of the samples in the window, clipped to the trace.
pub fn baseline(samples: &[u16], window: &SampleWindow) -> f64 {
    let stop = window.stop.min(samples.len());
    let start = window.start.min(stop);
    if start == stop {
        return 0.0;
    }
    samples[start..stop].iter().map(|&s| s as f64).sum::<f64>() / (stop - start) as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PulseScan {
    height: f64,
    position: Option<usize>,
    area: f64,
}

/// Peak search and running area over `samples[from..]`.
fn scan_pulse(samples: &[u16], baseline: f64, sign: f64, from: usize) -> PulseScan {
    let mut scan = PulseScan {
        height: 0.0,
        position: None,
        area: 0.0,
    };
    for (i, &s) in samples.iter().enumerate().skip(from) {
        let h = sign * (s as f64 - baseline);
        scan.area += h;
        if scan.position.is_none() || h > scan.height {
            scan.height = h;
            scan.position = Some(i);
        }
    }
    scan
}

fn integrate(samples: &[u16], baseline: f64, sign: f64, range: Range<usize>) -> f64 {
    samples[range]
        .iter()
        .map(|&s| sign * (s as f64 - baseline))
        .sum()
}

/// Gate offsets placed at `anchor` and clipped to `[0, len)`.
fn gate_range(anchor: usize, gate: &GateWindow, len: usize) -> Range<usize> {
    let place = |offset: i64| (anchor as i64 + offset).clamp(0, len as i64) as usize;
    let start = place(gate.start);
    start..place(gate.stop).max(start)
}

#[derive(Debug, Clone, Copy)]
struct PeakGates {
    total: GateWindow,
    tail: GateWindow,
}

/// Full-Waveform analysis: PSD gates are positioned on the detected peak.
#[derive(Debug, Clone)]
pub struct FullWaveformAnalyzer {
    gates: Vec<PeakGates>,
}

impl FullWaveformAnalyzer {
    pub fn new(channels: &[ChannelConfig]) -> Self {
        Self {
            gates: channels
                .iter()
                .map(|c| PeakGates {
                    total: c.psd_total,
                    tail: c.psd_tail,
                })
                .collect(),
        }
    }
}

impl PulseAnalyzer for FullWaveformAnalyzer {
    fn analyze(&self, event: &RawEvent, channel: &ChannelConfig) -> AnalyzedEvent {
        let samples = &event.samples;
        let sign = channel.polarity.sign();
        let base = baseline(samples, &channel.baseline);
        let scan = scan_pulse(samples, base, sign, channel.baseline.stop);

        let (psd_total, psd_tail) = match (scan.position, self.gates.get(event.channel)) {
            (Some(peak), Some(gates)) => (
                integrate(samples, base, sign, gate_range(peak, &gates.total, samples.len())),
                integrate(samples, base, sign, gate_range(peak, &gates.tail, samples.len())),
            ),
            _ => (0.0, 0.0),
        };

        AnalyzedEvent {
            board_id: event.board_id,
            channel: event.channel,
            baseline: base,
            peak_position: scan.position,
            height: scan.height,
            area: scan.area,
            psd_total,
            psd_tail,
            timestamp: 0,
            calibrated: None,
        }
    }
}

#[derive(Debug, Clone)]
struct FixedGates {
    total: Range<usize>,
    tail: Range<usize>,
}

/// Feature-List analysis: on-board features, or the embedded trace with PSD
/// gates fixed relative to the pre-trigger boundary.
#[derive(Debug, Clone)]
pub struct FeatureListAnalyzer {
    gates: Vec<FixedGates>,
}

impl FeatureListAnalyzer {
    pub fn new(channels: &[ChannelConfig]) -> Self {
        Self {
            gates: channels
                .iter()
                .map(|c| FixedGates {
                    total: gate_range(c.pre_trigger, &c.psd_total, c.record_length),
                    tail: gate_range(c.pre_trigger, &c.psd_tail, c.record_length),
                })
                .collect(),
        }
    }

    fn from_device(event: &RawEvent, features: &DeviceFeatures) -> AnalyzedEvent {
        let q_long = features.q_long as f64;
        AnalyzedEvent {
            board_id: event.board_id,
            channel: event.channel,
            baseline: features.baseline as f64,
            peak_position: None,
            height: features.height as f64,
            area: q_long,
            psd_total: q_long,
            psd_tail: q_long - features.q_short as f64,
            timestamp: 0,
            calibrated: None,
        }
    }
}

impl PulseAnalyzer for FeatureListAnalyzer {
    fn analyze(&self, event: &RawEvent, channel: &ChannelConfig) -> AnalyzedEvent {
        let samples = &event.samples;
        if samples.is_empty() {
            let features = event.features.unwrap_or_default();
            return Self::from_device(event, &features);
        }

        let sign = channel.polarity.sign();
        let base = baseline(samples, &channel.baseline);
        let scan = scan_pulse(samples, base, sign, channel.baseline.stop);
        let clip = |r: &Range<usize>| r.start.min(samples.len())..r.end.min(samples.len());
        let (psd_total, psd_tail) = match self.gates.get(event.channel) {
            Some(gates) => (
                integrate(samples, base, sign, clip(&gates.total)),
                integrate(samples, base, sign, clip(&gates.tail)),
            ),
            None => (0.0, 0.0),
        };

        AnalyzedEvent {
            board_id: event.board_id,
            channel: event.channel,
            baseline: base,
            peak_position: scan.position,
            height: scan.height,
            area: scan.area,
            psd_total,
            psd_tail,
            timestamp: 0,
            calibrated: None,
        }
    }
}
