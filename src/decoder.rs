//! Readout buffer decoding.
//!
//! A buffer is a sequence of little-endian 32-bit words holding one or more
//! records. Every record starts with a four word header:
//!
//! | word | bits    | content                                  |
//! |------|---------|------------------------------------------|
//! | 0    | 31..28  | `0xA` marker                             |
//! | 0    | 27..0   | record size in words, header included    |
//! | 1    | 31..27  | board id                                 |
//! | 1    | 15..0   | mask of the channels present             |
//! | 2    | 23..0   | record / aggregate counter               |
//! | 3    | 30..0   | trigger time tag                         |
//!
//! The payload that follows depends on the readout format:
//!
//! * Full-Waveform: for each channel in the mask, `record_length / 2` words
//!   with two samples per word, low half first.
//! * Sparse: see [`crate::zle`].
//! * Feature-List: one block per channel in the mask. Block word 0 is
//!   `1 << 31 | block size`, word 1 carries the trace flag (bit 30) and the
//!   samples per event (bits 15..0). Each event is a time tag word, the
//!   optional trace words, `baseline << 16 | height` and
//!   `q_long << 16 | pileup << 15 | q_short`.

use crate::{
    timestamp::COUNTER_MASK, DecodeError, OperatingMode, SessionConfig, SparseDecoder,
};
use log::warn;

pub const HEADER_WORDS: usize = 4;
const HEADER_MARKER: u32 = 0xA;
const SIZE_MASK: u32 = 0x0FFF_FFFF;
const COUNTER_FIELD_MASK: u32 = 0x00FF_FFFF;

const BLOCK_MARKER: u32 = 1 << 31;
const BLOCK_SIZE_MASK: u32 = 0x003F_FFFF;
const TRACE_FLAG: u32 = 1 << 30;
const PILEUP_FLAG: u32 = 1 << 15;
const Q_SHORT_MASK: u32 = 0x7FFF;
/// Time tag, extras and charge words of a feature event.
const FEATURE_WORDS: usize = 3;

pub(crate) fn read_word(bytes: &[u8], word: usize) -> Option<u32> {
    let start = word.checked_mul(4)?;
    let b = bytes.get(start..start + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn word_count(bytes: &[u8]) -> usize {
    bytes.len() / 4
}

/// Unpack `count` samples stored two per word starting at `word`.
pub(crate) fn unpack_samples(bytes: &[u8], word: usize, count: usize) -> Option<Vec<u16>> {
    let mut samples = Vec::with_capacity(count);
    for i in 0..count.div_ceil(2) {
        let w = read_word(bytes, word + i)?;
        samples.push((w & 0xFFFF) as u16);
        if samples.len() < count {
            samples.push((w >> 16) as u16);
        }
    }
    Some(samples)
}

pub fn pack_samples(samples: &[u16]) -> Vec<u32> {
    samples
        .chunks(2)
        .map(|pair| pair[0] as u32 | (pair.get(1).copied().unwrap_or(0) as u32) << 16)
        .collect()
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub size_words: usize,
    pub board_id: usize,
    pub channel_mask: u16,
    pub counter: u32,
    pub time_tag: u32,
}

impl RecordHeader {
    pub fn parse(bytes: &[u8], word: usize) -> Option<Self> {
        let w0 = read_word(bytes, word)?;
        if w0 >> 28 != HEADER_MARKER {
            return None;
        }
        let w1 = read_word(bytes, word + 1)?;
        Some(Self {
            size_words: (w0 & SIZE_MASK) as usize,
            board_id: (w1 >> 27) as usize,
            channel_mask: (w1 & 0xFFFF) as u16,
            counter: read_word(bytes, word + 2)? & COUNTER_FIELD_MASK,
            time_tag: read_word(bytes, word + 3)? & COUNTER_MASK,
        })
    }

    pub fn encode(&self) -> [u32; HEADER_WORDS] {
        [
            HEADER_MARKER << 28 | (self.size_words as u32 & SIZE_MASK),
            (self.board_id as u32) << 27 | self.channel_mask as u32,
            self.counter & COUNTER_FIELD_MASK,
            self.time_tag & COUNTER_MASK,
        ]
    }

    pub fn has_channel(&self, channel: usize) -> bool {
        channel < 16 && self.channel_mask & (1 << channel) != 0
    }

    /// Channels present, in payload order.
    pub fn channels(&self) -> impl Iterator<Item = usize> + '_ {
        (0..16).filter(|&ch| self.has_channel(ch))
    }
}

/// Header of a record located in the current buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordIndex {
    pub word: usize,
    pub header: RecordHeader,
}

/// Walk the record headers in `bytes`. Indexing stops at the first header
/// that is missing or whose size runs past the end of the buffer.
pub(crate) fn index_records(bytes: &[u8]) -> Vec<RecordIndex> {
    let total = word_count(bytes);
    let mut records = Vec::new();
    let mut word = 0;
    while word < total {
        let Some(header) = RecordHeader::parse(bytes, word) else {
            warn!("no record header at word {word} of {total}, dropping the rest of the buffer");
            break;
        };
        if header.size_words < HEADER_WORDS || word + header.size_words > total {
            warn!(
                "record at word {word} claims {} words but {} remain, dropping the rest of the buffer",
                header.size_words,
                total - word
            );
            break;
        }
        records.push(RecordIndex { word, header });
        word += header.size_words;
    }
    records
}

/// Build a record from per-channel payload words. `channels` must be sorted by channel.
pub fn encode_record(
    board_id: usize,
    counter: u32,
    time_tag: u32,
    channels: &[(usize, Vec<u32>)],
) -> Vec<u32> {
    let payload: usize = channels.iter().map(|(_, words)| words.len()).sum();
    let header = RecordHeader {
        size_words: HEADER_WORDS + payload,
        board_id,
        channel_mask: channels.iter().fold(0u16, |mask, (ch, _)| mask | 1 << *ch),
        counter,
        time_tag,
    };
    let mut words = Vec::with_capacity(header.size_words);
    words.extend_from_slice(&header.encode());
    for (_, payload) in channels {
        words.extend_from_slice(payload);
    }
    words
}

/// Feature fields computed on board in Feature-List mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFeatures {
    pub baseline: u16,
    pub height: u16,
    pub q_long: u16,
    pub q_short: u16,
    pub pileup: bool,
}

/// One trigger record for one channel, as pulled out of the readout buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub board_id: usize,
    pub channel: usize,
    /// Raw 31-bit trigger time tag.
    pub timestamp: u32,
    pub samples: Vec<u16>,
    pub features: Option<DeviceFeatures>,
}

/// Readout format strategy, chosen once per run.
pub trait RecordDecoder {
    /// Index the records held in `bytes` and return the number of events found.
    fn decode(&mut self, bytes: &[u8]) -> usize;

    /// Events available for `channel` in the last decoded buffer.
    fn event_count(&self, channel: usize) -> usize;

    fn event(&self, bytes: &[u8], index: usize, channel: usize) -> Result<RawEvent, DecodeError>;
}

pub fn decoder_for(config: &SessionConfig) -> Box<dyn RecordDecoder> {
    match (config.mode, config.zle) {
        (OperatingMode::FeatureList, _) => Box::new(FeatureDecoder::new()),
        (OperatingMode::FullWaveform, true) => Box::new(SparseDecoder::new(
            config.channels.iter().map(|c| c.record_length).collect(),
        )),
        (OperatingMode::FullWaveform, false) => Box::new(WaveformDecoder::new()),
    }
}

/// Fixed-length records, every channel in the mask with the same number of samples.
#[derive(Debug, Default)]
pub struct WaveformDecoder {
    records: Vec<RecordIndex>,
}

impl WaveformDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordDecoder for WaveformDecoder {
    fn decode(&mut self, bytes: &[u8]) -> usize {
        self.records = index_records(bytes);
        self.records.len()
    }

    fn event_count(&self, _channel: usize) -> usize {
        self.records.len()
    }

    fn event(&self, bytes: &[u8], index: usize, channel: usize) -> Result<RawEvent, DecodeError> {
        let record = self.records.get(index).ok_or(DecodeError::NoData)?;
        let header = &record.header;
        if !header.has_channel(channel) {
            return Err(DecodeError::NoData);
        }

        let n_channels = header.channel_mask.count_ones() as usize;
        let payload = header.size_words - HEADER_WORDS;
        if payload % n_channels != 0 {
            return Err(DecodeError::Malformed {
                channel,
                reason: format!("{payload} payload words do not split over {n_channels} channels"),
            });
        }
        let words_per_channel = payload / n_channels;
        let position = header.channels().take_while(|&ch| ch != channel).count();
        let start = record.word + HEADER_WORDS + position * words_per_channel;

        let samples =
            unpack_samples(bytes, start, 2 * words_per_channel).ok_or(DecodeError::NoData)?;
        Ok(RawEvent {
            board_id: header.board_id,
            channel,
            timestamp: header.time_tag,
            samples,
            features: None,
        })
    }
}

pub fn encode_waveform_record(
    board_id: usize,
    counter: u32,
    time_tag: u32,
    channels: &[(usize, Vec<u16>)],
) -> Vec<u32> {
    let payloads: Vec<(usize, Vec<u32>)> = channels
        .iter()
        .map(|(ch, samples)| (*ch, pack_samples(samples)))
        .collect();
    encode_record(board_id, counter, time_tag, &payloads)
}

#[derive(Debug, Clone, Copy)]
struct FeatureIndex {
    word: usize,
    board_id: usize,
    samples: usize,
    has_trace: bool,
}

/// Per-channel feature records; the per-channel event counts follow from the block sizes.
#[derive(Debug, Default)]
pub struct FeatureDecoder {
    events: Vec<Vec<FeatureIndex>>,
}

impl FeatureDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_aggregate(&mut self, bytes: &[u8], record: &RecordIndex) {
        let end = record.word + record.header.size_words;
        let mut word = record.word + HEADER_WORDS;
        for channel in record.header.channels() {
            let (Some(c0), Some(c1)) = (read_word(bytes, word), read_word(bytes, word + 1)) else {
                warn!("feature aggregate truncated before channel {channel}");
                return;
            };
            let size = (c0 & BLOCK_SIZE_MASK) as usize;
            if c0 & BLOCK_MARKER == 0 || size < 2 || word + size > end {
                warn!("bad feature block header for channel {channel} at word {word}");
                return;
            }

            let has_trace = c1 & TRACE_FLAG != 0;
            let samples = if has_trace { (c1 & 0xFFFF) as usize } else { 0 };
            let event_words = FEATURE_WORDS + samples.div_ceil(2);
            let body = size - 2;
            if body % event_words != 0 {
                warn!(
                    "channel {channel}: feature block of {body} words is not a multiple of {event_words}, skipping it"
                );
            } else {
                let slots = self.channel_slots(channel);
                slots.extend((0..body / event_words).map(|i| FeatureIndex {
                    word: word + 2 + i * event_words,
                    board_id: record.header.board_id,
                    samples,
                    has_trace,
                }));
            }
            word += size;
        }
    }

    fn channel_slots(&mut self, channel: usize) -> &mut Vec<FeatureIndex> {
        if self.events.len() <= channel {
            self.events.resize_with(channel + 1, Vec::new);
        }
        &mut self.events[channel]
    }
}

impl RecordDecoder for FeatureDecoder {
    fn decode(&mut self, bytes: &[u8]) -> usize {
        self.events.iter_mut().for_each(Vec::clear);
        for record in index_records(bytes) {
            self.index_aggregate(bytes, &record);
        }
        self.events.iter().map(Vec::len).sum()
    }

    fn event_count(&self, channel: usize) -> usize {
        self.events.get(channel).map_or(0, Vec::len)
    }

    fn event(&self, bytes: &[u8], index: usize, channel: usize) -> Result<RawEvent, DecodeError> {
        let slot = self
            .events
            .get(channel)
            .and_then(|events| events.get(index))
            .ok_or(DecodeError::NoData)?;

        let time_tag = read_word(bytes, slot.word).ok_or(DecodeError::NoData)? & COUNTER_MASK;
        let trace_words = slot.samples.div_ceil(2);
        let samples = if slot.has_trace {
            unpack_samples(bytes, slot.word + 1, slot.samples).ok_or(DecodeError::NoData)?
        } else {
            Vec::new()
        };
        let extras = read_word(bytes, slot.word + 1 + trace_words).ok_or(DecodeError::NoData)?;
        let charge = read_word(bytes, slot.word + 2 + trace_words).ok_or(DecodeError::NoData)?;

        Ok(RawEvent {
            board_id: slot.board_id,
            channel,
            timestamp: time_tag,
            samples,
            features: Some(DeviceFeatures {
                baseline: (extras >> 16) as u16,
                height: (extras & 0xFFFF) as u16,
                q_long: (charge >> 16) as u16,
                q_short: (charge & Q_SHORT_MASK) as u16,
                pileup: charge & PILEUP_FLAG != 0,
            }),
        })
    }
}

/// One on-board feature record, optionally with its trace.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureEvent {
    pub time_tag: u32,
    pub trace: Option<Vec<u16>>,
    pub features: DeviceFeatures,
}

/// Encode one channel block. All events of a block must share the trace length.
pub fn encode_feature_block(events: &[FeatureEvent]) -> Vec<u32> {
    let samples = events
        .first()
        .and_then(|e| e.trace.as_ref())
        .map_or(0, Vec::len);
    let has_trace = events.first().is_some_and(|e| e.trace.is_some());

    let mut body = Vec::new();
    for event in events {
        body.push(event.time_tag & COUNTER_MASK);
        if let Some(trace) = event.trace.as_ref().filter(|_| has_trace) {
            body.extend(pack_samples(trace));
        }
        let f = &event.features;
        body.push((f.baseline as u32) << 16 | f.height as u32);
        let pileup = if f.pileup { PILEUP_FLAG } else { 0 };
        body.push((f.q_long as u32) << 16 | pileup | (f.q_short as u32 & Q_SHORT_MASK));
    }

    let mut block = Vec::with_capacity(body.len() + 2);
    block.push(BLOCK_MARKER | (body.len() as u32 + 2));
    let flags = if has_trace { TRACE_FLAG } else { 0 };
    block.push(flags | (samples as u32 & 0xFFFF));
    block.extend(body);
    block
}

pub fn encode_feature_aggregate(
    board_id: usize,
    counter: u32,
    time_tag: u32,
    channels: &[(usize, Vec<FeatureEvent>)],
) -> Vec<u32> {
    let blocks: Vec<(usize, Vec<u32>)> = channels
        .iter()
        .map(|(ch, events)| (*ch, encode_feature_block(events)))
        .collect();
    encode_record(board_id, counter, time_tag, &blocks)
}
