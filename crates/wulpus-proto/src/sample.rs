//! Layout of one acquisition block as pushed in a `GET_DATA` frame.

use std::fmt;

use crate::SAMPLE_BLOCK_LEN;

/// Bytes before the first sample: data-valid marker, TX/RX config id and the
/// little-endian acquisition number.
pub const SAMPLE_PREAMBLE_LEN: usize = 4;

pub const SAMPLES_PER_BLOCK: usize = (SAMPLE_BLOCK_LEN - SAMPLE_PREAMBLE_LEN) / 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    pub data_valid: u8,
    pub tx_rx_id: u8,
    pub acq_nr: u16,
    pub samples: Vec<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLengthError {
    pub actual: usize,
}

impl fmt::Display for BlockLengthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sample block must be {} bytes, got {}",
            SAMPLE_BLOCK_LEN, self.actual
        )
    }
}

impl std::error::Error for BlockLengthError {}

impl Acquisition {
    pub fn parse(block: &[u8]) -> Result<Self, BlockLengthError> {
        if block.len() != SAMPLE_BLOCK_LEN {
            return Err(BlockLengthError {
                actual: block.len(),
            });
        }
        let samples = block[SAMPLE_PREAMBLE_LEN..]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Ok(Self {
            data_valid: block[0],
            tx_rx_id: block[1],
            acq_nr: u16::from_le_bytes([block[2], block[3]]),
            samples,
        })
    }
}
