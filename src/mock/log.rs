//! In-memory partition log used by the mock broker.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::codec::AbortedTransaction;
use crate::compression::{CompressionCodec, DEFAULT_COMPRESSION_LEVEL};
use crate::error::{KafkaCode, Result};
use crate::records::{
    BatchMeta, ControlRecordType, DecodedBatch, RecordBatch, RecordData, encode_records,
};
use crate::types::IsolationLevel;

/// A batch as stored by the mock, re-encoded on every fetch so that any
/// fetch version gets the record format it expects.
#[derive(Debug, Clone)]
pub(crate) struct StoredBatch {
    pub meta: BatchMeta,
    pub last_offset: i64,
    pub control: Option<ControlRecordType>,
    pub records: Vec<RecordData>,
}

impl StoredBatch {
    /// Encodes the batch in `magic`; `None` for control batches a legacy
    /// format cannot carry.
    fn encode(&self, magic: i8) -> Result<Option<Bytes>> {
        if let Some(kind) = self.control {
            if magic < 2 {
                return Ok(None);
            }
            let timestamp = self.records.first().map_or(0, |r| r.timestamp);
            let batch = RecordBatch::control_batch(
                kind,
                self.meta.producer_id,
                self.meta.producer_epoch,
                self.meta.base_offset,
                timestamp,
            );
            return batch.encode(DEFAULT_COMPRESSION_LEVEL).map(Some);
        }

        let mut meta = self.meta;
        if meta.codec.min_magic() > magic {
            meta.codec = CompressionCodec::None;
        }
        encode_records(magic, &meta, DEFAULT_COMPRESSION_LEVEL, &self.records).map(Some)
    }
}

#[derive(Debug, Clone, Copy)]
struct ProducerState {
    epoch: i16,
    next_sequence: i32,
}

#[derive(Debug, Clone, Copy)]
struct AbortedRange {
    producer_id: i64,
    first_offset: i64,
    last_offset: i64,
}

/// Result of reading a partition for a fetch.
#[derive(Debug, Default)]
pub(crate) struct PartitionRead {
    pub records: Bytes,
    pub aborted: Vec<AbortedTransaction>,
}

#[derive(Debug, Default)]
pub(crate) struct PartitionLog {
    batches: Vec<StoredBatch>,
    next_offset: i64,
    log_start_offset: i64,
    producers: HashMap<i64, ProducerState>,
    /// producer id -> first offset of its undecided transaction
    open_txns: HashMap<i64, i64>,
    aborted: Vec<AbortedRange>,
}

impl PartitionLog {
    pub fn high_watermark(&self) -> i64 {
        self.next_offset
    }

    pub fn log_start_offset(&self) -> i64 {
        self.log_start_offset
    }

    pub fn last_stable_offset(&self) -> i64 {
        self.open_txns
            .values()
            .min()
            .copied()
            .unwrap_or(self.next_offset)
    }

    pub fn batches(&self) -> &[StoredBatch] {
        &self.batches
    }

    fn check_sequence(&self, batch: &DecodedBatch) -> std::result::Result<(), KafkaCode> {
        if batch.producer_id < 0 {
            return Ok(());
        }
        match self.producers.get(&batch.producer_id) {
            Some(state) if batch.producer_epoch < state.epoch => {
                Err(KafkaCode::InvalidProducerEpoch)
            }
            Some(state) if batch.producer_epoch == state.epoch => {
                if batch.base_sequence == state.next_sequence {
                    Ok(())
                } else if batch.base_sequence < state.next_sequence {
                    Err(KafkaCode::DuplicateSequenceNumber)
                } else {
                    Err(KafkaCode::OutOfOrderSequenceNumber)
                }
            }
            _ if batch.base_sequence != 0 => Err(KafkaCode::OutOfOrderSequenceNumber),
            _ => Ok(()),
        }
    }

    /// Appends produced batches, all or nothing. Returns the base offset of
    /// the first one.
    pub fn append_batches(&mut self, batches: Vec<DecodedBatch>) -> std::result::Result<i64, KafkaCode> {
        let mut expected: HashMap<i64, ProducerState> = HashMap::new();
        for batch in &batches {
            if batch.control {
                return Err(KafkaCode::CorruptMessage);
            }
            if batch.producer_id >= 0 {
                // later batches of the same request continue the sequence
                if let Some(state) = expected.get(&batch.producer_id) {
                    if batch.producer_epoch != state.epoch
                        || batch.base_sequence != state.next_sequence
                    {
                        return Err(KafkaCode::OutOfOrderSequenceNumber);
                    }
                } else {
                    self.check_sequence(batch)?;
                }
                expected.insert(
                    batch.producer_id,
                    ProducerState {
                        epoch: batch.producer_epoch,
                        next_sequence: batch.base_sequence + batch.records.len() as i32,
                    },
                );
            }
        }

        let base = self.next_offset;
        for batch in batches {
            if batch.records.is_empty() {
                continue;
            }
            let records: Vec<RecordData> =
                batch.records.iter().map(|r| r.to_record_data()).collect();
            self.push(
                BatchMeta {
                    base_offset: self.next_offset,
                    codec: batch.codec,
                    producer_id: batch.producer_id,
                    producer_epoch: batch.producer_epoch,
                    base_sequence: batch.base_sequence,
                    transactional: batch.transactional,
                    control: false,
                },
                None,
                records,
            );
        }
        self.producers.extend(expected);
        Ok(base)
    }

    /// Appends plain records outside any producer session.
    pub fn append_records(&mut self, records: Vec<RecordData>) -> i64 {
        let base = self.next_offset;
        if !records.is_empty() {
            self.push(
                BatchMeta {
                    base_offset: base,
                    ..BatchMeta::default()
                },
                None,
                records,
            );
        }
        base
    }

    /// Writes a commit or abort marker for `producer_id`'s open transaction.
    pub fn append_marker(
        &mut self,
        producer_id: i64,
        producer_epoch: i16,
        kind: ControlRecordType,
        timestamp: i64,
    ) {
        let marker_offset = self.next_offset;
        let first_offset = self.open_txns.remove(&producer_id);
        self.push(
            BatchMeta {
                base_offset: marker_offset,
                producer_id,
                producer_epoch,
                transactional: true,
                control: true,
                ..BatchMeta::default()
            },
            Some(kind),
            vec![RecordData {
                timestamp,
                ..RecordData::default()
            }],
        );
        if let (ControlRecordType::Abort, Some(first_offset)) = (kind, first_offset) {
            self.aborted.push(AbortedRange {
                producer_id,
                first_offset,
                last_offset: marker_offset,
            });
        }
    }

    fn push(&mut self, meta: BatchMeta, control: Option<ControlRecordType>, records: Vec<RecordData>) {
        let last_offset = meta.base_offset + records.len() as i64 - 1;
        if meta.transactional && control.is_none() {
            self.open_txns
                .entry(meta.producer_id)
                .or_insert(meta.base_offset);
        }
        self.batches.push(StoredBatch {
            meta,
            last_offset,
            control,
            records,
        });
        self.next_offset = last_offset + 1;
    }

    /// Reads whole batches from `fetch_offset`. A batch that does not fit
    /// in `max_bytes` is cut at the limit.
    pub fn read(
        &self,
        fetch_offset: i64,
        max_bytes: usize,
        magic: i8,
        isolation: IsolationLevel,
    ) -> std::result::Result<PartitionRead, KafkaCode> {
        if fetch_offset < self.log_start_offset || fetch_offset > self.next_offset {
            return Err(KafkaCode::OffsetOutOfRange);
        }
        let upper = match isolation {
            IsolationLevel::ReadCommitted => self.last_stable_offset(),
            IsolationLevel::ReadUncommitted => self.next_offset,
        };

        let mut out = BytesMut::new();
        for batch in &self.batches {
            if batch.last_offset < fetch_offset {
                continue;
            }
            if batch.meta.base_offset >= upper {
                break;
            }
            let Some(encoded) = batch.encode(magic).map_err(|_| KafkaCode::CorruptMessage)? else {
                continue;
            };
            let room = max_bytes.saturating_sub(out.len());
            if encoded.len() > room {
                out.extend_from_slice(&encoded[..room]);
                break;
            }
            out.extend_from_slice(&encoded);
        }

        let aborted = match isolation {
            IsolationLevel::ReadCommitted => self
                .aborted
                .iter()
                .filter(|a| a.last_offset >= fetch_offset && a.first_offset < upper)
                .map(|a| AbortedTransaction {
                    producer_id: a.producer_id,
                    first_offset: a.first_offset,
                })
                .collect(),
            IsolationLevel::ReadUncommitted => Vec::new(),
        };

        Ok(PartitionRead {
            records: out.freeze(),
            aborted,
        })
    }

    /// First offset whose record timestamp is at or after `timestamp`.
    pub fn offset_for_time(&self, timestamp: i64) -> i64 {
        for batch in self.batches.iter().filter(|b| b.control.is_none()) {
            if let Some(i) = batch.records.iter().position(|r| r.timestamp >= timestamp) {
                return batch.meta.base_offset + i as i64;
            }
        }
        self.next_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::decode_records;

    fn record(value: &str) -> RecordData {
        RecordData {
            value: Some(Bytes::from(value.to_string())),
            timestamp: 1_000,
            ..RecordData::default()
        }
    }

    fn idempotent_batch(pid: i64, epoch: i16, seq: i32, n: usize) -> DecodedBatch {
        DecodedBatch {
            magic: 2,
            base_offset: 0,
            last_offset: n as i64 - 1,
            codec: CompressionCodec::None,
            producer_id: pid,
            producer_epoch: epoch,
            base_sequence: seq,
            transactional: false,
            control: false,
            control_type: None,
            records: (0..n)
                .map(|i| crate::records::DecodedRecord {
                    offset: i as i64,
                    timestamp: 1_000,
                    key: None,
                    value: Some(Bytes::from(format!("v{}", i))),
                    headers: vec![],
                })
                .collect(),
        }
    }

    #[test]
    fn test_sequence_validation() {
        let mut log = PartitionLog::default();
        assert_eq!(log.append_batches(vec![idempotent_batch(7, 0, 0, 2)]), Ok(0));
        assert_eq!(log.append_batches(vec![idempotent_batch(7, 0, 2, 1)]), Ok(2));
        assert_eq!(
            log.append_batches(vec![idempotent_batch(7, 0, 2, 1)]),
            Err(KafkaCode::DuplicateSequenceNumber)
        );
        assert_eq!(
            log.append_batches(vec![idempotent_batch(7, 0, 9, 1)]),
            Err(KafkaCode::OutOfOrderSequenceNumber)
        );
        // a bumped epoch restarts at zero
        assert_eq!(log.append_batches(vec![idempotent_batch(7, 1, 0, 1)]), Ok(3));
        assert_eq!(
            log.append_batches(vec![idempotent_batch(7, 0, 3, 1)]),
            Err(KafkaCode::InvalidProducerEpoch)
        );
        assert_eq!(log.high_watermark(), 4);
    }

    #[test]
    fn test_read_bounds() {
        let mut log = PartitionLog::default();
        log.append_records(vec![record("a"), record("b")]);
        assert!(log.read(2, 1024, 2, IsolationLevel::ReadUncommitted).is_ok());
        assert_eq!(
            log.read(3, 1024, 2, IsolationLevel::ReadUncommitted).unwrap_err(),
            KafkaCode::OffsetOutOfRange
        );
        assert_eq!(
            log.read(-1, 1024, 2, IsolationLevel::ReadUncommitted).unwrap_err(),
            KafkaCode::OffsetOutOfRange
        );
    }

    #[test]
    fn test_read_truncates_at_max_bytes() {
        let mut log = PartitionLog::default();
        log.append_records(vec![record("first")]);
        log.append_records(vec![record("second")]);

        let read = log.read(0, 100, 2, IsolationLevel::ReadUncommitted).unwrap();
        let set = decode_records(read.records).unwrap();
        assert_eq!(set.batches.len(), 1);
        assert!(set.partial_trailing);
    }

    #[test]
    fn test_aborted_transaction_visibility() {
        let mut log = PartitionLog::default();
        let mut batch = idempotent_batch(3, 0, 0, 2);
        batch.transactional = true;
        log.append_batches(vec![batch]).unwrap();
        assert_eq!(log.last_stable_offset(), 0);

        log.append_marker(3, 0, ControlRecordType::Abort, 1_000);
        assert_eq!(log.last_stable_offset(), 3);

        let committed = log.read(0, 1 << 20, 2, IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(
            committed.aborted,
            vec![AbortedTransaction {
                producer_id: 3,
                first_offset: 0
            }]
        );
        let uncommitted = log.read(0, 1 << 20, 2, IsolationLevel::ReadUncommitted).unwrap();
        assert!(uncommitted.aborted.is_empty());
    }

    #[test]
    fn test_legacy_read_drops_control_batches() {
        let mut log = PartitionLog::default();
        let mut batch = idempotent_batch(3, 0, 0, 1);
        batch.transactional = true;
        log.append_batches(vec![batch]).unwrap();
        log.append_marker(3, 0, ControlRecordType::Commit, 1_000);

        let read = log.read(0, 1 << 20, 1, IsolationLevel::ReadUncommitted).unwrap();
        let set = decode_records(read.records).unwrap();
        assert_eq!(set.batches.len(), 1);
        assert!(!set.batches[0].control);
    }

    #[test]
    fn test_offset_for_time() {
        let mut log = PartitionLog::default();
        let mut late = record("late");
        late.timestamp = 5_000;
        log.append_records(vec![record("early"), late]);
        assert_eq!(log.offset_for_time(2_000), 1);
        assert_eq!(log.offset_for_time(9_000), 2);
    }
}
