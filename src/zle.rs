//! Zero-length encoded (sparse) Full-Waveform records.
//!
//! Each channel in the record mask contributes one block: a size word (block
//! length in words, itself included) followed by control words. A control
//! word has bit 31 set for a stored run and clear for a suppressed one, and
//! the run length in samples in bits 20..0. Stored runs are followed by their
//! samples packed two per word. The runs of a channel must add up to the
//! record length; anything else is the long-record corner case of the
//! firmware and the event is dropped.

use crate::{
    decoder::{encode_record, index_records, pack_samples, read_word, unpack_samples, RecordIndex},
    DecodeError, RawEvent, RecordDecoder, ZeroSuppressionEdge, ZleSettings, HEADER_WORDS,
};

const STORED: u32 = 1 << 31;
const RUN_MASK: u32 = 0x001F_FFFF;

#[derive(Debug, Default)]
pub struct SparseDecoder {
    record_lengths: Vec<usize>,
    records: Vec<RecordIndex>,
}

impl SparseDecoder {
    /// `record_lengths[ch]` is the full (unsuppressed) record length of channel `ch`.
    pub fn new(record_lengths: Vec<usize>) -> Self {
        Self {
            record_lengths,
            records: Vec::new(),
        }
    }

    fn decode_block(
        &self,
        bytes: &[u8],
        start: usize,
        size: usize,
        channel: usize,
    ) -> Result<Vec<u16>, DecodeError> {
        let malformed = |reason: String| DecodeError::Malformed { channel, reason };

        if size < 2 {
            return Err(malformed(format!("undersized block of {size} words")));
        }
        let expected = self.record_lengths.get(channel).copied().unwrap_or(0);
        let end = start + size;
        let mut word = start + 1;
        let mut covered = 0;
        let mut samples = Vec::new();

        while word < end {
            let control = read_word(bytes, word).ok_or(DecodeError::NoData)?;
            let run = (control & RUN_MASK) as usize;
            word += 1;
            if control & STORED != 0 {
                let data_words = run.div_ceil(2);
                if word + data_words > end {
                    return Err(malformed(format!(
                        "stored run of {run} samples overruns the block at word {word}"
                    )));
                }
                samples.extend(unpack_samples(bytes, word, run).ok_or(DecodeError::NoData)?);
                word += data_words;
            }
            covered += run;
        }

        if covered != expected {
            return Err(malformed(format!(
                "control words cover {covered} samples, record length is {expected}"
            )));
        }
        Ok(samples)
    }
}

impl RecordDecoder for SparseDecoder {
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

        let end = record.word + header.size_words;
        let mut word = record.word + HEADER_WORDS;
        for ch in header.channels() {
            let size = read_word(bytes, word).ok_or(DecodeError::NoData)? as usize;
            if size == 0 || word + size > end {
                return Err(DecodeError::Malformed {
                    channel,
                    reason: format!("block of channel {ch} claims {size} words past the record end"),
                });
            }
            if ch == channel {
                let samples = self.decode_block(bytes, word, size, channel)?;
                return Ok(RawEvent {
                    board_id: header.board_id,
                    channel,
                    timestamp: header.time_tag,
                    samples,
                    features: None,
                });
            }
            word += size;
        }
        Err(DecodeError::NoData)
    }
}

/// Which samples survive zero suppression: every sample past the threshold,
/// widened by the look-back and look-forward padding.
pub fn kept_samples(samples: &[u16], settings: &ZleSettings) -> Vec<bool> {
    let over = |s: u16| match settings.edge {
        ZeroSuppressionEdge::Rise => s >= settings.threshold,
        ZeroSuppressionEdge::Fall => s <= settings.threshold,
    };
    let mut keep = vec![false; samples.len()];
    for (i, _) in samples.iter().enumerate().filter(|&(_, &s)| over(s)) {
        let from = i.saturating_sub(settings.look_back);
        let to = (i + settings.look_forward + 1).min(samples.len());
        keep[from..to].iter_mut().for_each(|k| *k = true);
    }
    keep
}

/// Encode one channel block, size word included.
pub fn encode_block(samples: &[u16], settings: &ZleSettings) -> Vec<u32> {
    let keep = kept_samples(samples, settings);
    let mut block = vec![0];
    let mut i = 0;
    while i < samples.len() {
        let stored = keep[i];
        let run = keep[i..].iter().take_while(|&&k| k == stored).count();
        let flag = if stored { STORED } else { 0 };
        block.push(flag | (run as u32 & RUN_MASK));
        if stored {
            block.extend(pack_samples(&samples[i..i + run]));
        }
        i += run;
    }
    block[0] = block.len() as u32;
    block
}

pub fn encode_sparse_record(
    board_id: usize,
    counter: u32,
    time_tag: u32,
    channels: &[(usize, Vec<u16>)],
    settings: &ZleSettings,
) -> Vec<u32> {
    let blocks: Vec<(usize, Vec<u32>)> = channels
        .iter()
        .map(|(ch, samples)| (*ch, encode_block(samples, settings)))
        .collect();
    encode_record(board_id, counter, time_tag, &blocks)
}
