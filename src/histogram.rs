use crate::{AnalyzedEvent, PsdParameter, SpectrumQuantity};
use ndarray::{Array1, Array2};

/// Fixed binning of one histogram axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSpec {
    pub bins: usize,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outside {
    Under,
    Over,
}

impl AxisSpec {
    pub fn new(bins: usize, min: f64, max: f64) -> Self {
        Self {
            bins: bins.max(1),
            min,
            max,
        }
    }

    pub fn width(&self) -> f64 {
        (self.max - self.min) / self.bins as f64
    }

    pub fn center(&self, bin: usize) -> f64 {
        self.min + (bin as f64 + 0.5) * self.width()
    }

    fn bin(&self, value: f64) -> Result<usize, Outside> {
        if value.is_nan() || value >= self.max {
            Err(Outside::Over)
        } else if value < self.min {
            Err(Outside::Under)
        } else {
            let bin = ((value - self.min) / self.width()) as usize;
            Ok(bin.min(self.bins - 1))
        }
    }
}

/// 1-D pulse height or energy spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    axis: AxisSpec,
    counts: Array1<u64>,
    underflow: u64,
    overflow: u64,
}

impl Spectrum {
    pub fn new(axis: AxisSpec) -> Self {
        Self {
            axis,
            counts: Array1::zeros(axis.bins),
            underflow: 0,
            overflow: 0,
        }
    }

    pub fn fill(&mut self, value: f64) {
        match self.axis.bin(value) {
            Ok(bin) => self.counts[bin] += 1,
            Err(Outside::Under) => self.underflow += 1,
            Err(Outside::Over) => self.overflow += 1,
        }
    }

    pub fn axis(&self) -> &AxisSpec {
        &self.axis
    }

    pub fn counts(&self) -> &Array1<u64> {
        &self.counts
    }

    /// Entries inside the axis range.
    pub fn entries(&self) -> u64 {
        self.counts.sum()
    }

    pub fn underflow(&self) -> u64 {
        self.underflow
    }

    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    /// `(bin center, content)` pairs.
    pub fn rows(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .map(|(i, &c)| (self.axis.center(i), c))
    }
}

/// 2-D histogram of total integral (x) against the discrimination parameter (y).
#[derive(Debug, Clone, PartialEq)]
pub struct PsdHistogram {
    x: AxisSpec,
    y: AxisSpec,
    counts: Array2<u64>,
    outside: u64,
}

impl PsdHistogram {
    pub fn new(x: AxisSpec, y: AxisSpec) -> Self {
        Self {
            x,
            y,
            counts: Array2::zeros((x.bins, y.bins)),
            outside: 0,
        }
    }

    pub fn fill(&mut self, x: f64, y: f64) {
        match (self.x.bin(x), self.y.bin(y)) {
            (Ok(i), Ok(j)) => self.counts[[i, j]] += 1,
            _ => self.outside += 1,
        }
    }

    pub fn x_axis(&self) -> &AxisSpec {
        &self.x
    }

    pub fn y_axis(&self) -> &AxisSpec {
        &self.y
    }

    pub fn counts(&self) -> &Array2<u64> {
        &self.counts
    }

    pub fn entries(&self) -> u64 {
        self.counts.sum()
    }

    /// Fills that landed outside either axis.
    pub fn outside(&self) -> u64 {
        self.outside
    }
}

/// Lower/upper level discriminator. Values must lie strictly between the bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscriminatorWindow {
    pub low: f64,
    pub high: f64,
}

impl DiscriminatorWindow {
    pub fn contains(&self, value: f64) -> bool {
        value > self.low && value < self.high
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramConfig {
    pub spectrum: AxisSpec,
    pub psd_total: AxisSpec,
    pub psd_param: AxisSpec,
    /// PSD fills require a total integral above this.
    pub psd_threshold: f64,
    pub psd_parameter: PsdParameter,
    pub quantity: SpectrumQuantity,
    /// Per-channel discriminator windows.
    pub windows: Vec<Option<DiscriminatorWindow>>,
    /// Channel whose in-window events make the whole event group eligible for output.
    pub trigger_channel: Option<usize>,
}

impl HistogramConfig {
    pub fn new(num_channels: usize) -> Self {
        Self {
            spectrum: AxisSpec::new(200, 0.0, 4096.0),
            psd_total: AxisSpec::new(150, 0.0, 60000.0),
            psd_param: AxisSpec::new(150, 0.0, 1.0),
            psd_threshold: 0.0,
            psd_parameter: PsdParameter::TailToTotal,
            quantity: SpectrumQuantity::PulseHeight,
            windows: vec![None; num_channels],
            trigger_channel: None,
        }
    }
}

/// Per-channel spectra and PSD histograms for one run.
#[derive(Debug, Clone)]
pub struct HistogramAccumulator {
    config: HistogramConfig,
    spectra: Vec<Spectrum>,
    psd: Vec<PsdHistogram>,
    group_accepted: bool,
}

impl HistogramAccumulator {
    pub fn new(config: HistogramConfig) -> Self {
        let n = config.windows.len();
        Self {
            spectra: vec![Spectrum::new(config.spectrum); n],
            psd: vec![PsdHistogram::new(config.psd_total, config.psd_param); n],
            config,
            group_accepted: false,
        }
    }

    pub fn config(&self) -> &HistogramConfig {
        &self.config
    }

    pub fn num_channels(&self) -> usize {
        self.spectra.len()
    }

    pub fn spectrum(&self, channel: usize) -> Option<&Spectrum> {
        self.spectra.get(channel)
    }

    pub fn psd(&self, channel: usize) -> Option<&PsdHistogram> {
        self.psd.get(channel)
    }

    /// Start a new multi-channel event group.
    pub fn begin_group(&mut self) {
        self.group_accepted = false;
    }

    /// Whether the current group may be persisted.
    pub fn group_accepted(&self) -> bool {
        self.config.trigger_channel.is_none() || self.group_accepted
    }

    /// Fill the channel spectrum, subject to its discriminator window.
    /// An accepted fill on the trigger channel accepts the current group.
    /// Returns whether the value was accepted.
    pub fn fill_spectrum(&mut self, channel: usize, value: f64) -> bool {
        let Some(spectrum) = self.spectra.get_mut(channel) else {
            return false;
        };
        let window = self.config.windows.get(channel).copied().flatten();
        let accepted = window.is_none_or(|w| w.contains(value));
        if accepted {
            spectrum.fill(value);
            if self.config.trigger_channel == Some(channel) {
                self.group_accepted = true;
            }
        }
        accepted
    }

    /// Fill the PSD histogram when `total` exceeds the threshold.
    pub fn fill_psd(&mut self, channel: usize, total: f64, tail: f64) -> bool {
        if total <= self.config.psd_threshold {
            return false;
        }
        let Some(hist) = self.psd.get_mut(channel) else {
            return false;
        };
        let y = match self.config.psd_parameter {
            PsdParameter::Tail => tail,
            PsdParameter::TailToTotal => tail / total,
        };
        hist.fill(total, y);
        true
    }

    /// Spectrum and PSD fills for one analysed event.
    pub fn fill(&mut self, event: &AnalyzedEvent) -> bool {
        let accepted =
            self.fill_spectrum(event.channel, event.spectrum_value(self.config.quantity));
        self.fill_psd(event.channel, event.psd_total, event.psd_tail);
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulator(windows: Vec<Option<DiscriminatorWindow>>) -> HistogramAccumulator {
        HistogramAccumulator::new(HistogramConfig {
            spectrum: AxisSpec::new(100, 0.0, 100.0),
            windows,
            ..HistogramConfig::new(0)
        })
    }

    #[test]
    fn discriminator_window_is_exclusive() {
        let mut hist = accumulator(vec![Some(DiscriminatorWindow {
            low: 10.0,
            high: 20.0,
        })]);
        assert!(hist.fill_spectrum(0, 15.0));
        assert!(!hist.fill_spectrum(0, 20.0));
        assert!(!hist.fill_spectrum(0, 9.0));
        let spectrum = hist.spectrum(0).unwrap();
        assert_eq!(spectrum.entries(), 1);
        assert_eq!(spectrum.counts()[15], 1);
    }

    #[test]
    fn no_window_fills_everything() {
        let mut hist = accumulator(vec![None]);
        for v in [-1.0, 0.0, 50.5, 99.99, 100.0, f64::NAN] {
            assert!(hist.fill_spectrum(0, v));
        }
        let spectrum = hist.spectrum(0).unwrap();
        assert_eq!(spectrum.entries(), 3);
        assert_eq!(spectrum.underflow(), 1);
        assert_eq!(spectrum.overflow(), 2);
        assert_eq!(spectrum.counts()[99], 1);
        assert!(!hist.fill_spectrum(3, 1.0));
    }

    #[test]
    fn trigger_channel_gates_the_group() {
        let window = Some(DiscriminatorWindow {
            low: 10.0,
            high: 20.0,
        });
        let mut hist = HistogramAccumulator::new(HistogramConfig {
            windows: vec![None, window],
            trigger_channel: Some(1),
            ..HistogramConfig::new(2)
        });

        hist.begin_group();
        hist.fill_spectrum(0, 15.0);
        assert!(!hist.group_accepted());
        hist.fill_spectrum(1, 25.0);
        assert!(!hist.group_accepted());
        hist.fill_spectrum(1, 12.0);
        assert!(hist.group_accepted());

        hist.begin_group();
        assert!(!hist.group_accepted());
    }

    #[test]
    fn trigger_channel_without_window_accepts_every_fill() {
        let mut hist = HistogramAccumulator::new(HistogramConfig {
            trigger_channel: Some(1),
            ..HistogramConfig::new(2)
        });
        hist.begin_group();
        hist.fill_spectrum(0, 15.0);
        assert!(!hist.group_accepted());
        hist.fill_spectrum(1, 5000.0);
        assert!(hist.group_accepted());
    }

    #[test]
    fn groups_are_open_without_trigger_channel() {
        let mut hist = accumulator(vec![None]);
        hist.begin_group();
        assert!(hist.group_accepted());
    }

    #[test]
    fn psd_threshold_and_parameter() {
        let mut hist = HistogramAccumulator::new(HistogramConfig {
            psd_total: AxisSpec::new(10, 0.0, 1000.0),
            psd_param: AxisSpec::new(10, 0.0, 1.0),
            psd_threshold: 100.0,
            ..HistogramConfig::new(1)
        });
        assert!(!hist.fill_psd(0, 100.0, 10.0));
        assert!(hist.fill_psd(0, 500.0, 125.0));
        let psd = hist.psd(0).unwrap();
        assert_eq!(psd.counts()[[5, 2]], 1);
        assert_eq!(psd.entries(), 1);

        let mut tail = HistogramAccumulator::new(HistogramConfig {
            psd_total: AxisSpec::new(10, 0.0, 1000.0),
            psd_param: AxisSpec::new(10, 0.0, 1000.0),
            psd_parameter: PsdParameter::Tail,
            ..HistogramConfig::new(1)
        });
        tail.fill_psd(0, 500.0, 125.0);
        tail.fill_psd(0, 500.0, 5000.0);
        assert_eq!(tail.psd(0).unwrap().counts()[[5, 1]], 1);
        assert_eq!(tail.psd(0).unwrap().outside(), 1);
    }

    #[test]
    fn bin_centers() {
        let axis = AxisSpec::new(4, 0.0, 8.0);
        assert_eq!(axis.center(0), 1.0);
        assert_eq!(axis.center(3), 7.0);
        let spectrum = Spectrum::new(axis);
        let rows: Vec<(f64, u64)> = spectrum.rows().collect();
        assert_eq!(rows, vec![(1.0, 0), (3.0, 0), (5.0, 0), (7.0, 0)]);
    }
}
