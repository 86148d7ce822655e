use crate::{
    analyzer_for, decoder_for, utils, AnalyzedEvent, CalibrationEngine, ControlStyle, Counter,
    DaqError, DaqResult, DecodeError, DeviceReturn, Digitizer, HistogramAccumulator,
    OperatingMode, PulseAnalyzer, RawEvent, ReadoutBuffer, RecordDecoder, RecordEmitter,
    RecordSink, SessionConfig, TimestampNormalizer,
};
use log::{debug, error, info, warn};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use time::OffsetDateTime;

/// Acquisition lifecycle: `Idle -> Prepared -> Running -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Prepared,
    Running,
}

/// Summary of one run, finalized when the run stops.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMetadata {
    pub start: OffsetDateTime,
    pub stop: Option<OffsetDateTime>,
    pub requested_duration: Option<Duration>,
    pub actual_duration: Duration,
    /// The acquisition timer ended the run.
    pub timed_out: bool,
    pub events: u64,
    /// Events dropped as malformed.
    pub skipped: u64,
    pub bytes: u64,
}

impl RunMetadata {
    pub fn begin(requested_duration: Option<Duration>) -> Self {
        Self {
            start: OffsetDateTime::now_utc(),
            stop: None,
            requested_duration,
            actual_duration: Duration::ZERO,
            timed_out: false,
            events: 0,
            skipped: 0,
            bytes: 0,
        }
    }
}

/// Read-only snapshot handed to the host after every readout cycle.
#[derive(Debug)]
pub struct SessionView<'a> {
    pub state: SessionState,
    pub board_id: usize,
    pub mode: OperatingMode,
    pub events: u64,
    pub skipped: u64,
    pub elapsed: Duration,
    pub run_duration: Option<Duration>,
    pub counter: &'a Counter,
    pub histograms: &'a HistogramAccumulator,
    pub last_events: &'a [Option<AnalyzedEvent>],
}

/// The cooperative yield point of the acquisition loop, called once per
/// readout cycle on the acquisition thread.
pub trait Host {
    fn process_events(&mut self, view: &SessionView<'_>);
}

impl<F: FnMut(&SessionView<'_>)> Host for F {
    fn process_events(&mut self, view: &SessionView<'_>) {
        self(view)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    Continue,
    DeviceStopped,
    TimedOut,
}

pub struct AcquisitionSession<D: Digitizer> {
    config: SessionConfig,
    device: D,
    state: SessionState,
    decoder: Box<dyn RecordDecoder>,
    analyzer: Box<dyn PulseAnalyzer>,
    normalizers: Vec<TimestampNormalizer>,
    calibration: CalibrationEngine,
    histograms: HistogramAccumulator,
    emitter: RecordEmitter,
    buffer: Option<ReadoutBuffer>,
    enable: Arc<AtomicBool>,
    counter: Counter,
    last_events: Vec<Option<AnalyzedEvent>>,
    run_start: Instant,
    events: u64,
    skipped: u64,
}

impl<D: Digitizer> AcquisitionSession<D> {
    pub fn new(
        config: SessionConfig,
        device: D,
        sink: Option<Box<dyn RecordSink>>,
    ) -> DaqResult<Self> {
        config.validate()?;
        let n = config.channels.len();
        Ok(Self {
            decoder: decoder_for(&config),
            analyzer: analyzer_for(config.mode, &config.channels),
            normalizers: vec![TimestampNormalizer::new(); n],
            calibration: CalibrationEngine::new(n),
            histograms: HistogramAccumulator::new(config.histograms.clone()),
            emitter: RecordEmitter::new(&config, sink),
            buffer: None,
            enable: Arc::new(AtomicBool::new(false)),
            counter: Counter::new(),
            last_events: vec![None; n],
            run_start: Instant::now(),
            events: 0,
            skipped: 0,
            state: SessionState::Idle,
            config,
            device,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn histograms(&self) -> &HistogramAccumulator {
        &self.histograms
    }

    pub fn calibration(&self) -> &CalibrationEngine {
        &self.calibration
    }

    pub fn last_event(&self, channel: usize) -> Option<&AnalyzedEvent> {
        self.last_events.get(channel).and_then(Option::as_ref)
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn rollovers(&self, channel: usize) -> Option<u64> {
        self.normalizers.get(channel).map(TimestampNormalizer::rollovers)
    }

    /// Clearing the flag stops the run at the next cycle boundary.
    pub fn enable_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enable)
    }

    /// Replace the configuration. Takes effect at the next `prepare`.
    pub fn configure(&mut self, config: SessionConfig) -> DaqResult<()> {
        self.ensure_not_running("configure")?;
        config.validate()?;
        self.stop()?;
        self.config = config;
        Ok(())
    }

    fn ensure_not_running(&self, op: &'static str) -> DaqResult<()> {
        if self.state == SessionState::Running {
            return Err(DaqError::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Reset run state, allocate histograms and the readout buffer, and arm the device.
    pub fn prepare(&mut self) -> DaqResult<()> {
        self.ensure_not_running("prepare")?;

        let n = self.config.channels.len();
        self.normalizers = vec![TimestampNormalizer::new(); n];
        self.last_events = vec![None; n];
        self.histograms = HistogramAccumulator::new(self.config.histograms.clone());
        self.decoder = decoder_for(&self.config);
        self.analyzer = analyzer_for(self.config.mode, &self.config.channels);
        self.emitter.reset(&self.config);
        self.calibration.resize(n);
        self.events = 0;
        self.skipped = 0;
        utils::log_session_config(&self.config);

        let enabled: Vec<_> = self.config.enabled_channels().cloned().collect();
        if let Err(e) = self
            .device
            .arm(self.config.control_style, &enabled)
            .check("arm")
        {
            error!("Board {}: arming failed: {e}", self.device.board_id());
            self.buffer = None;
            self.state = SessionState::Idle;
            return Err(e);
        }
        self.buffer = Some(ReadoutBuffer::with_capacity(self.device.buffer_size()));
        self.state = SessionState::Prepared;
        info!(
            "Board {} armed for {:?}",
            self.device.board_id(),
            self.config.control_style
        );
        Ok(())
    }

    /// Run readout cycles until the enable flag is cleared, the device stops
    /// or the acquisition timer expires. `host` is called after every cycle.
    pub fn start<H: Host + ?Sized>(&mut self, host: &mut H) -> DaqResult<RunMetadata> {
        if self.state != SessionState::Prepared {
            return Err(DaqError::InvalidState {
                op: "start",
                state: self.state,
            });
        }
        if let Err(e) = self.emitter.begin_run() {
            error!("Board {}: cannot open run for recording: {e}", self.device.board_id());
            return Err(DaqError::Sink(e));
        }
        if self.config.control_style == ControlStyle::SoftwareStart {
            self.device.start().check("start")?;
        }

        self.state = SessionState::Running;
        self.enable.store(true, Ordering::SeqCst);
        self.counter.reset();
        self.run_start = Instant::now();
        let mut metadata = RunMetadata::begin(self.config.run_duration);
        info!("Board {}: acquisition started", self.device.board_id());

        let outcome = self.run_loop(host);
        metadata.timed_out = matches!(outcome, Ok(Cycle::TimedOut));
        let finished = self.finish_run(metadata);
        match (outcome, finished) {
            (Ok(_), finished) => finished,
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(stop_err)) => {
                warn!("stop after failed run also failed: {stop_err}");
                Err(e)
            }
        }
    }

    fn run_loop<H: Host + ?Sized>(&mut self, host: &mut H) -> DaqResult<Cycle> {
        loop {
            if !self.enable.load(Ordering::SeqCst) {
                info!("Acquisition disabled");
                return Ok(Cycle::Continue);
            }
            match self.readout_cycle()? {
                Cycle::Continue => {}
                Cycle::DeviceStopped => {
                    info!("Board {} reported stop", self.device.board_id());
                    return Ok(Cycle::DeviceStopped);
                }
                Cycle::TimedOut => {
                    info!("Acquisition timer expired");
                    return Ok(Cycle::TimedOut);
                }
            }
            host.process_events(&self.view());
        }
    }

    pub fn view(&self) -> SessionView<'_> {
        SessionView {
            state: self.state,
            board_id: self.config.board_id,
            mode: self.config.mode,
            events: self.events,
            skipped: self.skipped,
            elapsed: self.run_start.elapsed(),
            run_duration: self.config.run_duration,
            counter: &self.counter,
            histograms: &self.histograms,
            last_events: &self.last_events,
        }
    }

    /// Disarm a prepared session without running it.
    pub fn stop(&mut self) -> DaqResult<()> {
        match self.state {
            SessionState::Idle => Ok(()),
            SessionState::Prepared | SessionState::Running => {
                self.enable.store(false, Ordering::SeqCst);
                self.buffer = None;
                self.state = SessionState::Idle;
                self.device.stop().check("stop")
            }
        }
    }

    fn finish_run(&mut self, mut metadata: RunMetadata) -> DaqResult<RunMetadata> {
        self.enable.store(false, Ordering::SeqCst);
        let stopped = self.device.stop().check("stop");
        self.buffer = None;
        self.state = SessionState::Idle;

        metadata.stop = Some(OffsetDateTime::now_utc());
        metadata.actual_duration = self.run_start.elapsed();
        metadata.events = self.events;
        metadata.skipped = self.skipped;
        metadata.bytes = self.counter.total_size as u64;
        info!(
            "Board {}: run finished after {:.2} s, {} events ({} skipped){}",
            self.device.board_id(),
            metadata.actual_duration.as_secs_f64(),
            metadata.events,
            metadata.skipped,
            if metadata.timed_out { ", timer expired" } else { "" }
        );

        let finalized = self.emitter.finalize(&metadata);
        stopped?;
        finalized?;
        Ok(metadata)
    }

    fn timer_expired(&self) -> bool {
        self.config
            .run_duration
            .is_some_and(|d| self.run_start.elapsed() >= d)
    }

    fn idle_cycle(&self) -> Cycle {
        if self.timer_expired() {
            Cycle::TimedOut
        } else {
            Cycle::Continue
        }
    }

    fn readout_cycle(&mut self) -> DaqResult<Cycle> {
        let Some(mut buffer) = self.buffer.take() else {
            return Err(DaqError::InvalidState {
                op: "read out",
                state: self.state,
            });
        };
        let cycle = self.read_and_process(&mut buffer);
        self.buffer = Some(buffer);
        cycle
    }

    fn read_and_process(&mut self, buffer: &mut ReadoutBuffer) -> DaqResult<Cycle> {
        buffer.clear();
        match self.device.read_data(buffer) {
            DeviceReturn::Success => {}
            DeviceReturn::Timeout => return Ok(self.idle_cycle()),
            DeviceReturn::Stop => return Ok(Cycle::DeviceStopped),
            code => {
                return Err(DaqError::Device {
                    command: "read_data",
                    code,
                })
            }
        }
        if buffer.is_empty() {
            return Ok(self.idle_cycle());
        }
        self.counter.increment(buffer.filled());

        let bytes = buffer.bytes();
        let found = self.decoder.decode(bytes);
        if found == 0 {
            debug!("no events in {} byte buffer", bytes.len());
            return Ok(self.idle_cycle());
        }
        match self.config.mode {
            OperatingMode::FullWaveform => self.process_records(bytes, found),
            OperatingMode::FeatureList => self.process_channels(bytes),
        }
    }

    /// Records in device order, enabled channels inside each record. One record is one group.
    /// When the timer expires inside a record, the channels seen so far form its group.
    fn process_records(&mut self, bytes: &[u8], records: usize) -> DaqResult<Cycle> {
        let channels: Vec<usize> = self.config.enabled_channels().map(|c| c.channel).collect();
        for index in 0..records {
            self.histograms.begin_group();
            let mut group = Vec::with_capacity(channels.len());
            let mut expired = false;
            for &channel in &channels {
                if let Some(pair) = self.next_event(bytes, index, channel) {
                    group.push(pair);
                }
                if self.timer_expired() {
                    expired = true;
                    break;
                }
            }
            self.emit_group(&group)?;
            if expired {
                return Ok(Cycle::TimedOut);
            }
        }
        Ok(Cycle::Continue)
    }

    /// Enabled channels, then the events the device reported for each. Every event is its own group.
    fn process_channels(&mut self, bytes: &[u8]) -> DaqResult<Cycle> {
        let channels: Vec<usize> = self.config.enabled_channels().map(|c| c.channel).collect();
        for channel in channels {
            for index in 0..self.decoder.event_count(channel) {
                self.histograms.begin_group();
                if let Some(pair) = self.next_event(bytes, index, channel) {
                    self.emit_group(std::slice::from_ref(&pair))?;
                }
                if self.timer_expired() {
                    return Ok(Cycle::TimedOut);
                }
            }
        }
        Ok(Cycle::Continue)
    }

    fn next_event(
        &mut self,
        bytes: &[u8],
        index: usize,
        channel: usize,
    ) -> Option<(RawEvent, AnalyzedEvent)> {
        match self.decoder.event(bytes, index, channel) {
            Ok(raw) => {
                let analyzed = self.process_event(&raw)?;
                Some((raw, analyzed))
            }
            Err(DecodeError::NoData) => None,
            Err(e @ DecodeError::Malformed { .. }) => {
                warn!("skipping event {index}: {e}");
                self.skipped += 1;
                None
            }
        }
    }

    /// Analysis, timestamp correction, calibration and histogramming of one channel event.
    fn process_event(&mut self, raw: &RawEvent) -> Option<AnalyzedEvent> {
        let channel = self.config.channels.get(raw.channel)?;
        let mut event = self.analyzer.analyze(raw, channel);
        event.timestamp = self.normalizers[raw.channel].normalize(raw.timestamp);
        event.calibrated = self.calibration.calibrate(&event);
        self.histograms.fill(&event);
        self.events += 1;
        self.last_events[raw.channel] = Some(event.clone());
        Some(event)
    }

    fn emit_group(&mut self, group: &[(RawEvent, AnalyzedEvent)]) -> DaqResult<()> {
        if !self.histograms.group_accepted() {
            return Ok(());
        }
        for (raw, event) in group {
            self.emitter.emit(raw, event)?;
        }
        Ok(())
    }

    pub fn add_calibration_point(
        &mut self,
        channel: usize,
        index: usize,
        raw: f64,
        energy: f64,
    ) -> DaqResult<()> {
        self.ensure_not_running("add calibration point")?;
        Ok(self.calibration.add_point(channel, index, raw, energy)?)
    }

    pub fn reset_calibration(&mut self, channel: usize) -> DaqResult<()> {
        self.ensure_not_running("reset calibration")?;
        Ok(self.calibration.reset(channel)?)
    }

    pub fn activate_calibration(&mut self, channel: usize) -> DaqResult<()> {
        self.ensure_not_running("activate calibration")?;
        Ok(self.calibration.activate(channel)?)
    }

    pub fn load_calibration(&mut self, channel: usize, path: &Path) -> DaqResult<usize> {
        self.ensure_not_running("load calibration")?;
        Ok(self.calibration.load(channel, path)?)
    }

    pub fn write_calibration(&self, channel: usize, path: &Path) -> DaqResult<()> {
        self.ensure_not_running("write calibration")?;
        Ok(self.calibration.write(channel, path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decoder::{encode_feature_aggregate, encode_waveform_record, words_to_bytes},
        zle::encode_sparse_record,
        ChannelConfig, DeviceFeatures, DiscriminatorWindow, EventRecord, FeatureEvent,
        RecordFields, ZeroSuppressionEdge, ZleSettings,
    };
    use anyhow::anyhow;
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    /// Replays canned buffers, then reports `Stop`.
    struct ScriptedDigitizer {
        reads: VecDeque<(DeviceReturn, Vec<u8>)>,
        arm_code: DeviceReturn,
        start_code: DeviceReturn,
        armed: bool,
        stops: usize,
        idle: DeviceReturn,
    }

    impl ScriptedDigitizer {
        fn new(buffers: Vec<Vec<u8>>) -> Self {
            Self {
                reads: buffers
                    .into_iter()
                    .map(|b| (DeviceReturn::Success, b))
                    .collect(),
                arm_code: DeviceReturn::Success,
                start_code: DeviceReturn::Success,
                armed: false,
                stops: 0,
                idle: DeviceReturn::Stop,
            }
        }
    }

    impl Digitizer for ScriptedDigitizer {
        fn board_id(&self) -> usize {
            0
        }

        fn buffer_size(&self) -> usize {
            1 << 16
        }

        fn arm(&mut self, _style: ControlStyle, _channels: &[ChannelConfig]) -> DeviceReturn {
            self.armed = self.arm_code == DeviceReturn::Success;
            self.arm_code
        }

        fn start(&mut self) -> DeviceReturn {
            self.start_code
        }

        fn stop(&mut self) -> DeviceReturn {
            self.armed = false;
            self.stops += 1;
            DeviceReturn::Success
        }

        fn read_data(&mut self, buffer: &mut ReadoutBuffer) -> DeviceReturn {
            match self.reads.pop_front() {
                Some((code, bytes)) => {
                    buffer.fill_from(&bytes);
                    code
                }
                None => self.idle,
            }
        }
    }

    struct VecSink(Rc<RefCell<Vec<(usize, u64)>>>);

    impl RecordSink for VecSink {
        fn write(&mut self, record: &EventRecord) -> anyhow::Result<()> {
            let ts = record.derived.map_or(0, |d| d.timestamp);
            self.0.borrow_mut().push((record.channel, ts));
            Ok(())
        }

        fn finalize(&mut self, _metadata: &RunMetadata) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RunLog {
        runs: Vec<usize>,
        records: Vec<usize>,
    }

    /// Counts records per opened run; refuses to open run `fail_on`.
    struct RunSink {
        log: Rc<RefCell<RunLog>>,
        fail_on: Option<usize>,
    }

    impl RecordSink for RunSink {
        fn begin_run(&mut self, run: usize) -> anyhow::Result<()> {
            if self.fail_on == Some(run) {
                return Err(anyhow!("cannot create run{run}"));
            }
            let mut log = self.log.borrow_mut();
            log.runs.push(run);
            log.records.push(0);
            Ok(())
        }

        fn write(&mut self, _record: &EventRecord) -> anyhow::Result<()> {
            let mut log = self.log.borrow_mut();
            let last = log.records.last_mut().ok_or_else(|| anyhow!("no run open"))?;
            *last += 1;
            Ok(())
        }

        fn finalize(&mut self, _metadata: &RunMetadata) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailingSink;

    impl RecordSink for FailingSink {
        fn write(&mut self, _record: &EventRecord) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }

        fn finalize(&mut self, _metadata: &RunMetadata) -> anyhow::Result<()> {
            Ok(())
        }
    }

    const LEN: usize = 32;

    fn small_config(mode: OperatingMode, channels: usize) -> SessionConfig {
        let mut config = SessionConfig::new(mode, channels);
        for ch in &mut config.channels {
            ch.record_length = LEN;
            ch.pre_trigger = 10;
            ch.baseline.stop = 8;
        }
        config
    }

    /// Flat at 100 with a peak of `height` at sample 12.
    fn trace(height: u16) -> Vec<u16> {
        let mut samples = vec![100u16; LEN];
        samples[12] = 100 + height;
        samples[13] = 100 + height / 2;
        samples
    }

    fn waveform_buffer(tags: &[u32], channels: &[usize], height: u16) -> Vec<u8> {
        let words: Vec<u32> = tags
            .iter()
            .enumerate()
            .flat_map(|(i, &tag)| {
                let payload: Vec<(usize, Vec<u16>)> =
                    channels.iter().map(|&ch| (ch, trace(height))).collect();
                encode_waveform_record(0, i as u32, tag, &payload)
            })
            .collect();
        words_to_bytes(&words)
    }

    fn no_host() -> impl FnMut(&SessionView<'_>) {
        |_: &SessionView<'_>| {}
    }

    #[test]
    fn full_waveform_run_fills_histograms() {
        let device = ScriptedDigitizer::new(vec![
            waveform_buffer(&[10, 20, 30], &[0, 1], 40),
            Vec::new(),
            waveform_buffer(&[40], &[0, 1], 40),
        ]);
        let mut session =
            AcquisitionSession::new(small_config(OperatingMode::FullWaveform, 2), device, None)
                .unwrap();
        session.prepare().unwrap();
        assert_eq!(session.state(), SessionState::Prepared);
        assert!(session.device().armed);

        let mut cycles = 0;
        let meta = session
            .start(&mut |_: &SessionView<'_>| cycles += 1)
            .unwrap();
        assert_eq!(cycles, 3);
        assert_eq!(meta.events, 8);
        assert!(!meta.timed_out);
        assert!(meta.stop.is_some());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.device().stops, 1);

        let spectrum = session.histograms().spectrum(0).unwrap();
        assert_eq!(spectrum.entries(), 4);
        let last = session.last_event(1).unwrap();
        assert_eq!(last.baseline, 100.0);
        assert_eq!(last.height, 40.0);
        assert_eq!(last.peak_position, Some(12));
        assert_eq!(last.timestamp, 40);
    }

    #[test]
    fn timestamps_stay_monotonic_across_a_wrap() {
        let wrap = 1u32 << 31;
        let device = ScriptedDigitizer::new(vec![waveform_buffer(&[wrap - 10, 5, 6], &[0], 40)]);
        let sink = Rc::new(RefCell::new(Vec::new()));
        let mut session = AcquisitionSession::new(
            small_config(OperatingMode::FullWaveform, 1),
            device,
            Some(Box::new(VecSink(sink.clone()))),
        )
        .unwrap();
        session.prepare().unwrap();
        session.start(&mut no_host()).unwrap();

        let stamps: Vec<u64> = sink.borrow().iter().map(|&(_, ts)| ts).collect();
        let wrap = wrap as u64;
        assert_eq!(stamps, vec![wrap - 10, wrap + 5, wrap + 6]);
        assert_eq!(session.rollovers(0), Some(1));
    }

    #[test]
    fn start_requires_prepare() {
        let mut session = AcquisitionSession::new(
            small_config(OperatingMode::FullWaveform, 1),
            ScriptedDigitizer::new(Vec::new()),
            None,
        )
        .unwrap();
        assert!(matches!(
            session.start(&mut no_host()),
            Err(DaqError::InvalidState {
                op: "start",
                state: SessionState::Idle
            })
        ));
    }

    #[test]
    fn arm_failure_stays_idle_and_start_failure_stays_prepared() {
        let mut device = ScriptedDigitizer::new(Vec::new());
        device.arm_code = DeviceReturn::Comm;
        let mut session =
            AcquisitionSession::new(small_config(OperatingMode::FullWaveform, 1), device, None)
                .unwrap();
        assert!(matches!(
            session.prepare(),
            Err(DaqError::Device { command: "arm", .. })
        ));
        assert_eq!(session.state(), SessionState::Idle);

        let mut device = ScriptedDigitizer::new(Vec::new());
        device.start_code = DeviceReturn::Generic;
        let mut session =
            AcquisitionSession::new(small_config(OperatingMode::FullWaveform, 1), device, None)
                .unwrap();
        session.prepare().unwrap();
        assert!(matches!(
            session.start(&mut no_host()),
            Err(DaqError::Device { command: "start", .. })
        ));
        assert_eq!(session.state(), SessionState::Prepared);
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn external_gate_skips_software_start() {
        let mut device = ScriptedDigitizer::new(vec![waveform_buffer(&[1], &[0], 40)]);
        device.start_code = DeviceReturn::Generic;
        let mut config = small_config(OperatingMode::FullWaveform, 1);
        config.control_style = ControlStyle::ExternalGate;
        let mut session = AcquisitionSession::new(config, device, None).unwrap();
        session.prepare().unwrap();
        assert_eq!(session.start(&mut no_host()).unwrap().events, 1);
    }

    #[test]
    fn clearing_the_enable_flag_stops_the_run() {
        let buffers = (0..10).map(|i| waveform_buffer(&[i], &[0], 40)).collect();
        let mut session = AcquisitionSession::new(
            small_config(OperatingMode::FullWaveform, 1),
            ScriptedDigitizer::new(buffers),
            None,
        )
        .unwrap();
        let enable = session.enable_flag();
        session.prepare().unwrap();
        let meta = session
            .start(&mut |view: &SessionView<'_>| {
                if view.events >= 2 {
                    enable.store(false, Ordering::SeqCst);
                }
            })
            .unwrap();
        assert_eq!(meta.events, 2);
        assert!(!meta.timed_out);
    }

    #[test]
    fn timer_expiry_ends_the_run() {
        let mut device = ScriptedDigitizer::new(Vec::new());
        device.idle = DeviceReturn::Timeout;
        let mut config = small_config(OperatingMode::FullWaveform, 1);
        config.run_duration = Some(Duration::ZERO);
        let mut session = AcquisitionSession::new(config, device, None).unwrap();
        session.prepare().unwrap();
        let meta = session.start(&mut no_host()).unwrap();
        assert!(meta.timed_out);
        assert_eq!(meta.requested_duration, Some(Duration::ZERO));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn timer_is_checked_per_channel_event() {
        let device = ScriptedDigitizer::new(vec![waveform_buffer(&[5, 6], &[0, 1], 40)]);
        let mut config = small_config(OperatingMode::FullWaveform, 2);
        config.run_duration = Some(Duration::ZERO);
        let sink = Rc::new(RefCell::new(Vec::new()));
        let mut session =
            AcquisitionSession::new(config, device, Some(Box::new(VecSink(sink.clone()))))
                .unwrap();
        session.prepare().unwrap();
        let meta = session.start(&mut no_host()).unwrap();
        assert!(meta.timed_out);
        assert_eq!(meta.events, 1);
        assert_eq!(*sink.borrow(), vec![(0, 5)]);
    }

    #[test]
    fn each_run_opens_its_own_record_run() {
        let mut device = ScriptedDigitizer::new(vec![
            waveform_buffer(&[1, 2, 3], &[0], 40),
            Vec::new(),
            waveform_buffer(&[4, 5], &[0], 40),
        ]);
        device.reads[1].0 = DeviceReturn::Stop;
        let log = Rc::new(RefCell::new(RunLog::default()));
        let sink = RunSink {
            log: log.clone(),
            fail_on: None,
        };
        let mut session = AcquisitionSession::new(
            small_config(OperatingMode::FullWaveform, 1),
            device,
            Some(Box::new(sink)),
        )
        .unwrap();

        for expected in [3, 2] {
            session.prepare().unwrap();
            let meta = session.start(&mut no_host()).unwrap();
            assert_eq!(meta.events, expected);
        }
        let log = log.borrow();
        assert_eq!(log.runs, vec![0, 1]);
        assert_eq!(log.records, vec![3, 2]);
    }

    #[test]
    fn record_run_failure_keeps_the_session_prepared() {
        let log = Rc::new(RefCell::new(RunLog::default()));
        let sink = RunSink {
            log: log.clone(),
            fail_on: Some(0),
        };
        let mut session = AcquisitionSession::new(
            small_config(OperatingMode::FullWaveform, 1),
            ScriptedDigitizer::new(vec![waveform_buffer(&[1], &[0], 40)]),
            Some(Box::new(sink)),
        )
        .unwrap();
        session.prepare().unwrap();
        assert!(matches!(
            session.start(&mut no_host()),
            Err(DaqError::Sink(_))
        ));
        assert_eq!(session.state(), SessionState::Prepared);
        assert_eq!(session.device().stops, 0);

        let meta = session.start(&mut no_host()).unwrap();
        assert_eq!(meta.events, 1);
        assert_eq!(log.borrow().runs, vec![1]);
    }

    #[test]
    fn trigger_channel_without_window_keeps_its_groups() {
        let mut config = small_config(OperatingMode::FullWaveform, 2);
        config.histograms.trigger_channel = Some(1);
        let sink = Rc::new(RefCell::new(Vec::new()));
        let mut session = AcquisitionSession::new(
            config,
            ScriptedDigitizer::new(vec![waveform_buffer(&[1, 2], &[0, 1], 40)]),
            Some(Box::new(VecSink(sink.clone()))),
        )
        .unwrap();
        session.prepare().unwrap();
        let meta = session.start(&mut no_host()).unwrap();
        assert_eq!(meta.events, 4);
        assert_eq!(sink.borrow().len(), 4);
    }

    #[test]
    fn malformed_sparse_records_are_skipped() {
        let zle = ZleSettings {
            threshold: 120,
            look_back: 10,
            look_forward: 10,
            edge: ZeroSuppressionEdge::Rise,
        };
        let mut config = small_config(OperatingMode::FullWaveform, 2);
        config.zle = true;
        for ch in &mut config.channels {
            ch.zle = Some(zle);
        }
        let good = encode_sparse_record(0, 0, 1, &[(0, trace(40))], &zle);
        let short = encode_sparse_record(0, 1, 2, &[(1, trace(40)[..LEN - 2].to_vec())], &zle);
        let bytes = words_to_bytes(&[good, short].concat());

        let mut session =
            AcquisitionSession::new(config, ScriptedDigitizer::new(vec![bytes]), None).unwrap();
        session.prepare().unwrap();
        let meta = session.start(&mut no_host()).unwrap();
        assert_eq!(meta.events, 1);
        assert_eq!(meta.skipped, 1);
        assert_eq!(session.last_event(0).unwrap().height, 40.0);
    }

    #[test]
    fn trigger_channel_selects_groups_for_output() {
        let mut config = small_config(OperatingMode::FullWaveform, 2);
        config.histograms.windows[1] = Some(DiscriminatorWindow {
            low: 30.0,
            high: 50.0,
        });
        config.histograms.trigger_channel = Some(1);
        let words = [
            encode_waveform_record(0, 0, 1, &[(0, trace(40)), (1, trace(40))]),
            encode_waveform_record(0, 1, 2, &[(0, trace(40)), (1, trace(80))]),
        ]
        .concat();
        let sink = Rc::new(RefCell::new(Vec::new()));
        let mut session = AcquisitionSession::new(
            config,
            ScriptedDigitizer::new(vec![words_to_bytes(&words)]),
            Some(Box::new(VecSink(sink.clone()))),
        )
        .unwrap();
        session.prepare().unwrap();
        session.start(&mut no_host()).unwrap();
        assert_eq!(*sink.borrow(), vec![(0, 1), (1, 1)]);
        assert_eq!(session.histograms().spectrum(1).unwrap().entries(), 1);
        assert_eq!(session.histograms().spectrum(0).unwrap().entries(), 2);
    }

    #[test]
    fn feature_list_events_are_their_own_groups() {
        let mut config = small_config(OperatingMode::FeatureList, 2);
        config.records = vec![RecordFields::default(); 2];
        let event = |tag: u32, q_long: u16| FeatureEvent {
            time_tag: tag,
            trace: None,
            features: DeviceFeatures {
                baseline: 100,
                height: 50,
                q_long,
                q_short: q_long / 2,
                pileup: false,
            },
        };
        let words = encode_feature_aggregate(
            0,
            0,
            0,
            &[
                (0, vec![event(5, 1000), event(9, 1200)]),
                (1, vec![event(7, 3000)]),
            ],
        );
        let sink = Rc::new(RefCell::new(Vec::new()));
        let mut session = AcquisitionSession::new(
            config,
            ScriptedDigitizer::new(vec![words_to_bytes(&words)]),
            Some(Box::new(VecSink(sink.clone()))),
        )
        .unwrap();
        session.prepare().unwrap();
        let meta = session.start(&mut no_host()).unwrap();
        assert_eq!(meta.events, 3);
        assert_eq!(*sink.borrow(), vec![(0, 5), (0, 9), (1, 7)]);
        let last = session.last_event(1).unwrap();
        assert_eq!(last.psd_total, 3000.0);
        assert_eq!(last.psd_tail, 1500.0);
    }

    #[test]
    fn sink_failure_stops_the_run() {
        let mut session = AcquisitionSession::new(
            small_config(OperatingMode::FullWaveform, 1),
            ScriptedDigitizer::new(vec![waveform_buffer(&[1, 2], &[0], 40)]),
            Some(Box::new(FailingSink)),
        )
        .unwrap();
        session.prepare().unwrap();
        assert!(matches!(
            session.start(&mut no_host()),
            Err(DaqError::Sink(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.device().stops, 1);
    }

    #[test]
    fn calibration_feeds_the_spectrum_and_is_locked_while_running() {
        let mut config = small_config(OperatingMode::FullWaveform, 1);
        config.histograms.spectrum = crate::AxisSpec::new(100, 0.0, 1000.0);
        let mut session = AcquisitionSession::new(
            config,
            ScriptedDigitizer::new(vec![waveform_buffer(&[1], &[0], 40)]),
            None,
        )
        .unwrap();
        session.add_calibration_point(0, 0, 0.0, 0.0).unwrap();
        session.add_calibration_point(0, 1, 10.0, 100.0).unwrap();
        session.activate_calibration(0).unwrap();
        session.prepare().unwrap();
        session.start(&mut no_host()).unwrap();
        let last = session.last_event(0).unwrap();
        assert_eq!(last.calibrated.map(|c| c.height), Some(400.0));
        assert_eq!(session.histograms().spectrum(0).unwrap().counts()[40], 1);

        session.state = SessionState::Running;
        assert!(matches!(
            session.add_calibration_point(0, 2, 20.0, 200.0),
            Err(DaqError::InvalidState { .. })
        ));
        assert!(session.reset_calibration(0).is_err());
        assert!(session.prepare().is_err());
        session.state = SessionState::Idle;
        session.reset_calibration(0).unwrap();
        assert!(!session.calibration().is_enabled(0));
    }
}
