//! Sensor-node response framing: `HEXCRC ":" PAYLOAD`.
//!
//! `HEXCRC` is the CRC-32 (IEEE 802.3) of the payload bytes as lowercase hex
//! without leading zeros. The payload is up to five `|`-separated rows of up
//! to five comma-separated decimals; the first field of a row is its sensor
//! code. Parsing is pure so it can be exercised without a socket.

use thiserror::Error;

use crate::config::{MAX_COLUMNS, MAX_ROWS, ROW_ID_COLUMN};

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("response has no ':' separator")]
    MissingSeparator,
    #[error("malformed crc field")]
    BadCrcField,
    #[error("crc mismatch: node sent {sent:x}, payload hashes to {computed:x}")]
    CrcMismatch { sent: u32, computed: u32 },
}

pub type Row = [f32; MAX_COLUMNS];

/// A validated response.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub crc: u32,
    rows: [Row; MAX_ROWS],
    row_count: usize,
}

impl Frame {
    pub fn rows(&self) -> &[Row] {
        &self.rows[..self.row_count]
    }
}

/// Row accessors that name the fields the node firmware emits.
pub trait RowFields {
    fn sensor_code(&self) -> i32;
    fn value1(&self) -> f32;
    fn value2(&self) -> f32;
    fn row_id(&self) -> i32;
}

impl RowFields for Row {
    fn sensor_code(&self) -> i32 {
        self[0] as i32
    }

    fn value1(&self) -> f32 {
        self[1]
    }

    fn value2(&self) -> f32 {
        self[2]
    }

    fn row_id(&self) -> i32 {
        self[ROW_ID_COLUMN] as i32
    }
}

fn parse_crc_field(field: &[u8]) -> Result<u32, FrameError> {
    let valid_digits = field.iter().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b));
    let leading_zero = field.len() > 1 && field[0] == b'0';

    if field.is_empty() || field.len() > 8 || !valid_digits || leading_zero {
        return Err(FrameError::BadCrcField);
    }

    let text = std::str::from_utf8(field).map_err(|_| FrameError::BadCrcField)?;
    u32::from_str_radix(text, 16).map_err(|_| FrameError::BadCrcField)
}

fn trim_response(raw: &[u8]) -> &[u8] {
    let end = raw
        .iter()
        .rposition(|&b| !matches!(b, 0 | b'\r' | b'\n'))
        .map_or(0, |i| i + 1);
    &raw[..end]
}

/// Validates the CRC and tokenises the payload into rows.
pub fn parse_frame(raw: &[u8]) -> Result<Frame, FrameError> {
    let raw = trim_response(raw);
    let split = raw.iter().position(|&b| b == b':').ok_or(FrameError::MissingSeparator)?;
    let (crc_field, payload) = (&raw[..split], &raw[split + 1..]);

    let sent = parse_crc_field(crc_field)?;
    let computed = crc32(payload);
    if sent != computed {
        return Err(FrameError::CrcMismatch { sent, computed });
    }

    let mut frame = Frame {
        crc: sent,
        rows: [[0.0; MAX_COLUMNS]; MAX_ROWS],
        row_count: 0,
    };
    tokenise(payload, &mut frame);
    Ok(frame)
}

// Stops quietly at the first token that is not a number.
fn tokenise(payload: &[u8], frame: &mut Frame) {
    let Ok(text) = std::str::from_utf8(payload) else {
        return;
    };

    for row_text in text.split('|') {
        if frame.row_count == MAX_ROWS {
            return;
        }

        let mut column = 0;
        for token in row_text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let Ok(value) = token.parse::<f32>() else {
                if column > 0 {
                    frame.row_count += 1;
                }
                return;
            };
            if column < MAX_COLUMNS {
                frame.rows[frame.row_count][column] = value;
            }
            column += 1;
        }

        if column > 0 {
            frame.row_count += 1;
        }
    }
}

/// Builds a well-formed response for `payload`, as a node would send it.
pub fn encode_frame(payload: &str) -> String {
    format!("{:x}:{}", crc32(payload.as_bytes()), payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROW: &str = "76,24.1,37.2,1001,42";

    #[test]
    fn crc32_matches_ieee_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn accepts_encoded_payload() {
        let frame = parse_frame(encode_frame(ROW).as_bytes()).unwrap();

        assert_eq!(frame.rows().len(), 1);
        let row = frame.rows()[0];
        assert_eq!(row.sensor_code(), 76);
        assert_eq!(row.value1(), 24.1);
        assert_eq!(row.value2(), 37.2);
        assert_eq!(row.row_id(), 42);
    }

    #[test]
    fn rejects_wrong_crc() {
        let raw = format!("ff:{}", ROW);
        assert!(matches!(
            parse_frame(raw.as_bytes()),
            Err(FrameError::CrcMismatch { sent: 0xff, .. })
        ));
    }

    #[test]
    fn missing_separator_is_an_error() {
        assert_eq!(parse_frame(ROW.as_bytes()), Err(FrameError::MissingSeparator));
        assert_eq!(parse_frame(b""), Err(FrameError::MissingSeparator));
    }

    #[test]
    fn crc_field_must_be_canonical_lowercase() {
        let crc = crc32(ROW.as_bytes());
        let upper = format!("{:X}:{}", crc, ROW);
        let padded = format!("0{:x}:{}", crc, ROW);

        if upper != encode_frame(ROW) {
            assert_eq!(parse_frame(upper.as_bytes()), Err(FrameError::BadCrcField));
        }
        assert_eq!(parse_frame(padded.as_bytes()), Err(FrameError::BadCrcField));
        assert_eq!(parse_frame(format!(":{}", ROW).as_bytes()), Err(FrameError::BadCrcField));
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let good = encode_frame("76,24.1,37.2,1001,42|44,21.5,55.0,0,43|");
        assert!(parse_frame(good.as_bytes()).is_ok());

        for i in 0..good.len() {
            for bit in 0..8 {
                let mut bytes = good.clone().into_bytes();
                bytes[i] ^= 1 << bit;
                assert!(
                    parse_frame(&bytes).is_err(),
                    "flip of bit {} in byte {} was accepted",
                    bit,
                    i
                );
            }
        }
    }

    #[test]
    fn multiple_rows_and_trailing_pipe() {
        let raw = encode_frame("76,24.1,37.2,1001,42|44,21.5,55.0,0,43|");
        let frame = parse_frame(format!("{}\r\n", raw).as_bytes()).unwrap();

        assert_eq!(frame.rows().len(), 2);
        assert_eq!(frame.rows()[1].sensor_code(), 44);
        assert_eq!(frame.rows()[1].row_id(), 43);
    }

    #[test]
    fn unknown_token_stops_parsing_without_error() {
        let frame = parse_frame(encode_frame("76,24.1,x,1001|44,1,2,3,4").as_bytes()).unwrap();

        assert_eq!(frame.rows().len(), 1);
        assert_eq!(frame.rows()[0], [76.0, 24.1, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn grid_is_capped_at_five_by_five() {
        let payload = "1,2,3,4,5,6,7|1|2|3|4|5|6";
        let frame = parse_frame(encode_frame(payload).as_bytes()).unwrap();

        assert_eq!(frame.rows().len(), 5);
        assert_eq!(frame.rows()[0], [1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(frame.rows()[4][0], 4.0);
    }

    #[test]
    fn spaced_pipe_tokens_advance_rows() {
        let frame = parse_frame(encode_frame("76,1,2,3,4,|,44,5,6,7,8").as_bytes()).unwrap();
        assert_eq!(frame.rows().len(), 2);
        assert_eq!(frame.rows()[1].sensor_code(), 44);
    }
}
