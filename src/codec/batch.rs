// Poll / lightlevel batch decoding: a concatenation of fixed 10-byte records,
// used to reconcile device state after (re)connect and after keep-alive.

use thiserror::Error;

const RECORD_LEN: usize = 10;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("batch length {0} is not a multiple of {RECORD_LEN}, truncated to {1} full records")]
    Truncated(usize, usize),
}

/// One decoded 10-byte status record: `addr, state, _, _, _, pos_lo, dim, pos_hi-ish, _, _`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchRecord {
    pub addr: u8,
    pub state: bool,
    pub dim: u8,
    pub cover_position: u16,
}

impl BatchRecord {
    fn decode(record: &[u8; RECORD_LEN]) -> Self {
        Self {
            addr: record[0],
            state: record[1] != 0,
            dim: record[6],
            cover_position: u16::from_le_bytes([record[5], record[6]]),
        }
    }
}

/// Decode a poll/lightlevel response into its constituent records. A length
/// not divisible by 10 is not fatal: the batch is truncated to the largest
/// multiple and the caller is told how many trailing bytes were dropped so it
/// can log a warning (per the "malformed batch" recovery policy).
pub fn decode_batch(data: &[u8]) -> (Vec<BatchRecord>, Option<BatchError>) {
    let whole_records = data.len() / RECORD_LEN;
    let usable = whole_records * RECORD_LEN;

    let records = data[..usable]
        .chunks_exact(RECORD_LEN)
        .map(|chunk| {
            let mut arr = [0u8; RECORD_LEN];
            arr.copy_from_slice(chunk);
            BatchRecord::decode(&arr)
        })
        .collect();

    let error = if usable != data.len() {
        Some(BatchError::Truncated(data.len(), whole_records))
    } else {
        None
    };

    (records, error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_c_poll_decoding() {
        let data: [u8; 20] = [
            0x05, 0x01, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let (records, error) = decode_batch(&data);
        assert!(error.is_none());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].addr, 5);
        assert!(records[0].state);
        assert_eq!(records[0].dim, 64);
        assert_eq!(records[1].addr, 7);
        assert!(!records[1].state);
        assert_eq!(records[1].dim, 0);
    }

    #[test]
    fn truncates_and_reports_non_multiple_length() {
        let data = vec![0u8; 23];
        let (records, error) = decode_batch(&data);
        assert_eq!(records.len(), 2);
        assert!(matches!(error, Some(BatchError::Truncated(23, 2))));
    }

    #[test]
    fn empty_batch_is_empty_no_error() {
        let (records, error) = decode_batch(&[]);
        assert!(records.is_empty());
        assert!(error.is_none());
    }
}
