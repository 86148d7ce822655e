use psd_daq::*;
use std::{
    fs,
    sync::{Arc, Mutex},
};

#[derive(Debug, Clone)]
struct Stored {
    channel: usize,
    trace_len: Option<usize>,
    derived: bool,
}

#[derive(Clone, Default)]
struct SharedSink {
    records: Arc<Mutex<Vec<Stored>>>,
    finalized: Arc<Mutex<Option<RunMetadata>>>,
}

impl RecordSink for SharedSink {
    fn write(&mut self, record: &EventRecord) -> anyhow::Result<()> {
        self.records.lock().unwrap().push(Stored {
            channel: record.channel,
            trace_len: record.trace.map(<[u16]>::len),
            derived: record.derived.is_some(),
        });
        Ok(())
    }

    fn finalize(&mut self, metadata: &RunMetadata) -> anyhow::Result<()> {
        *self.finalized.lock().unwrap() = Some(metadata.clone());
        Ok(())
    }
}

fn config(mode: OperatingMode) -> SessionConfig {
    let mut config = SessionConfig::new(mode, 4);
    for ch in &mut config.channels {
        ch.enabled = ch.channel == 1 || ch.channel == 3;
        ch.record_length = 256;
        ch.pre_trigger = 40;
        ch.baseline = SampleWindow { start: 0, stop: 30 };
    }
    config
}

fn run(
    config: SessionConfig,
    device: SimulatedDigitizer,
    sink: Option<SharedSink>,
) -> (AcquisitionSession<SimulatedDigitizer>, RunMetadata) {
    let sink = sink.map(|s| Box::new(s) as Box<dyn RecordSink>);
    let mut session = AcquisitionSession::new(config, device, sink).unwrap();
    session.prepare().unwrap();
    let mut views = 0;
    let metadata = session
        .start(&mut |view: &SessionView<'_>| {
            assert_eq!(view.state, SessionState::Running);
            views += 1;
        })
        .unwrap();
    assert!(views > 0);
    (session, metadata)
}

#[test]
fn full_waveform_run_end_to_end() {
    let device = SimulatedDigitizer::new(2, OperatingMode::FullWaveform, 42)
        .with_records_per_read(4)
        .with_max_reads(Some(3));
    let sink = SharedSink::default();
    let (session, metadata) = run(config(OperatingMode::FullWaveform), device, Some(sink.clone()));

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(metadata.events, 24);
    assert_eq!(metadata.skipped, 0);
    assert!(!metadata.timed_out);
    assert!(metadata.bytes > 0);
    assert!(!session.device().is_running());
    assert_eq!(session.device().reads(), 3);

    for ch in [1, 3] {
        let spectrum = session.histograms().spectrum(ch).unwrap();
        assert_eq!(spectrum.entries() + spectrum.underflow() + spectrum.overflow(), 12);
        let last = session.last_event(ch).unwrap();
        assert_eq!(last.board_id, 2);
        assert!(last.height > 50.0);
    }
    assert!(session.last_event(0).is_none());

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 24);
    assert!(records.iter().all(|r| r.derived && r.trace_len.is_none()));
    assert!(records.iter().all(|r| r.channel == 1 || r.channel == 3));
    let finalized = sink.finalized.lock().unwrap();
    assert_eq!(finalized.as_ref().map(|m| m.events), Some(24));
}

#[test]
fn feature_list_run_with_data_reduction() {
    let mut config = config(OperatingMode::FeatureList);
    for fields in &mut config.records {
        fields.raw_trace = true;
    }
    config.channels[3].data_reduction = Some(4);

    let device = SimulatedDigitizer::new(0, OperatingMode::FeatureList, 9)
        .with_traces(true)
        .with_records_per_read(6)
        .with_max_reads(Some(2));
    let sink = SharedSink::default();
    let (session, metadata) = run(config, device, Some(sink.clone()));

    assert_eq!(metadata.events, 24);
    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 24);
    let traces = |ch: usize| {
        records
            .iter()
            .filter(|r| r.channel == ch && r.trace_len.is_some())
            .count()
    };
    assert_eq!(traces(1), 12);
    assert_eq!(traces(3), 3);
    assert!(records
        .iter()
        .filter_map(|r| r.trace_len)
        .all(|len| len == 256));

    let psd_entries: u64 = [1, 3]
        .iter()
        .map(|&ch| {
            let psd = session.histograms().psd(ch).unwrap();
            psd.entries() + psd.outside()
        })
        .sum();
    assert!(psd_entries > 0);
}

#[test]
fn zero_length_encoded_run() {
    let mut config = config(OperatingMode::FullWaveform);
    config.zle = true;
    for ch in &mut config.channels {
        ch.zle = Some(ZleSettings {
            threshold: 1030,
            look_back: 10,
            look_forward: 10,
            edge: ZeroSuppressionEdge::Rise,
        });
    }
    for fields in &mut config.records {
        fields.raw_trace = true;
    }

    let device = SimulatedDigitizer::new(0, OperatingMode::FullWaveform, 5)
        .with_zle(true)
        .with_records_per_read(3)
        .with_max_reads(Some(2));
    let sink = SharedSink::default();
    let (_, metadata) = run(config, device, Some(sink.clone()));

    assert_eq!(metadata.events, 12);
    assert_eq!(metadata.skipped, 0);
    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 12);
    assert!(records
        .iter()
        .all(|r| r.trace_len.is_some_and(|len| len > 0 && len < 256)));
}

#[test]
fn timed_run_and_export() {
    let mut config = config(OperatingMode::FullWaveform);
    config.run_duration = Some(std::time::Duration::from_millis(50));
    let device = SimulatedDigitizer::new(0, OperatingMode::FullWaveform, 1)
        .with_records_per_read(2)
        .with_read_interval(std::time::Duration::from_millis(5));
    let (session, metadata) = run(config, device, None);
    assert!(metadata.timed_out);
    assert!(metadata.events > 0);

    let dir = tempfile::tempdir().unwrap();
    let spectrum = session.histograms().spectrum(1).unwrap();
    let path = dir.path().join("ch1.dat");
    assert!(export_spectrum(spectrum, &path).unwrap());
    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), spectrum.axis().bins);
    let total: u64 = text
        .lines()
        .map(|l| l.split('\t').nth(1).unwrap().parse::<u64>().unwrap())
        .sum();
    assert_eq!(total, spectrum.entries());

    let psd_path = dir.path().join("ch1_psd.csv");
    assert!(export_psd(session.histograms().psd(1).unwrap(), &psd_path).unwrap());
    let psd_text = fs::read_to_string(&psd_path).unwrap();
    assert_eq!(psd_text.lines().count(), 2 + 150);
}
