//! Checksums and framing helpers shared by every record format.
//!
//! Both legacy message-set entries and v2 record batches start with the same
//! twelve bytes (an i64 offset and an i32 length of what follows) and carry
//! their magic byte at offset 16:
//!
//! ```text
//! Offset  Size  Legacy message (v0/v1)    RecordBatch (v2)
//! 0       8     offset                    base_offset
//! 8       4     message_size              batch_length
//! 12      4     crc (IEEE)                partition_leader_epoch
//! 16      1     magic (0/1)               magic (2)
//! 17      4     attributes/timestamp...   crc (Castagnoli)
//! 21      2                               attributes
//! 23      4                               last_offset_delta
//! ...
//! ```

use crate::constants::{
    BATCH_CRC_DATA_START, BATCH_CRC_OFFSET, BATCH_LENGTH_OFFSET, BATCH_LOG_OVERHEAD,
    BATCH_MAGIC_OFFSET,
};

// CRC-32C polynomial used by Kafka (Castagnoli)
const CRC32C_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x82F63B78;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// CRC-32C checksum (Castagnoli polynomial) used by v2 record batches.
pub fn crc32c(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32C_TABLE[index];
    }
    !crc
}

/// CRC-32 (IEEE) checksum used by legacy magic 0/1 messages.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Result of CRC validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcValidationResult {
    Valid,
    Invalid { expected: u32, actual: u32 },
    /// Batch is too small to contain a CRC.
    TooSmall,
}

/// Validate the CRC-32C checksum of a v2 RecordBatch.
///
/// The CRC covers bytes from offset 21 (attributes) to the end of the batch.
pub fn validate_batch_crc(batch: &[u8]) -> CrcValidationResult {
    if batch.len() < BATCH_CRC_DATA_START {
        return CrcValidationResult::TooSmall;
    }

    let stored_crc = u32::from_be_bytes([
        batch[BATCH_CRC_OFFSET],
        batch[BATCH_CRC_OFFSET + 1],
        batch[BATCH_CRC_OFFSET + 2],
        batch[BATCH_CRC_OFFSET + 3],
    ]);
    let computed_crc = crc32c(&batch[BATCH_CRC_DATA_START..]);

    if stored_crc == computed_crc {
        CrcValidationResult::Valid
    } else {
        CrcValidationResult::Invalid {
            expected: stored_crc,
            actual: computed_crc,
        }
    }
}

/// Computes the CRC of a fully written v2 batch and stores it in the header.
pub fn stamp_batch_crc(batch: &mut [u8]) {
    if batch.len() >= BATCH_CRC_DATA_START {
        let crc = crc32c(&batch[BATCH_CRC_DATA_START..]);
        batch[BATCH_CRC_OFFSET..BATCH_CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
    }
}

/// Header of the next log entry in a record set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub magic: i8,
    /// Total length of the entry including the 12 byte offset/size prefix.
    pub total_len: usize,
}

/// Reads the magic and total length of the entry at the start of `buf`.
///
/// Returns `None` when the buffer does not hold a complete entry; brokers
/// routinely truncate the last entry of a fetch response at the size limit.
pub fn peek_entry(buf: &[u8]) -> Option<EntryHeader> {
    if buf.len() <= BATCH_MAGIC_OFFSET {
        return None;
    }
    let len = i32::from_be_bytes([
        buf[BATCH_LENGTH_OFFSET],
        buf[BATCH_LENGTH_OFFSET + 1],
        buf[BATCH_LENGTH_OFFSET + 2],
        buf[BATCH_LENGTH_OFFSET + 3],
    ]);
    if len < 0 {
        return None;
    }
    let total_len = BATCH_LOG_OVERHEAD + len as usize;
    if buf.len() < total_len {
        return None;
    }
    Some(EntryHeader {
        magic: buf[BATCH_MAGIC_OFFSET] as i8,
        total_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_known_values() {
        assert_eq!(crc32c(b""), 0x00000000);
        assert_eq!(crc32c(b"a"), 0xC1D04330);
        assert_eq!(crc32c(b"123456789"), 0xE3069283);
    }

    #[test]
    fn test_crc32_ieee_known_value() {
        assert_eq!(crc32_ieee(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_validate_batch_crc_too_small() {
        let batch = vec![0u8; 20];
        assert_eq!(validate_batch_crc(&batch), CrcValidationResult::TooSmall);
    }

    #[test]
    fn test_stamp_then_validate() {
        let mut batch = vec![0u8; 61];
        batch[21] = 0x01;
        batch[30] = 0xAB;
        stamp_batch_crc(&mut batch);
        assert_eq!(validate_batch_crc(&batch), CrcValidationResult::Valid);

        batch[40] = 0xFF;
        assert!(matches!(
            validate_batch_crc(&batch),
            CrcValidationResult::Invalid { .. }
        ));
    }

    #[test]
    fn test_peek_entry_complete_and_partial() {
        let mut entry = vec![0u8; 30];
        entry[8..12].copy_from_slice(&18i32.to_be_bytes());
        entry[16] = 2;

        assert_eq!(
            peek_entry(&entry),
            Some(EntryHeader {
                magic: 2,
                total_len: 30
            })
        );
        assert_eq!(peek_entry(&entry[..29]), None);
        assert_eq!(peek_entry(&entry[..10]), None);
    }
}
