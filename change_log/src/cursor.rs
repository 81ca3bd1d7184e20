//! Opaque pull cursors.
//!
//! A cursor encodes the sequence number of the last change a consumer saw;
//! the next pull resumes strictly after it. The decoder is deliberately
//! forgiving: anything that does not name a non-negative position reads from
//! the start of the stream, and fractional positions floor.

use data_types::SequenceNumber;

/// Encode `seq` as a cursor token.
pub fn encode(seq: SequenceNumber) -> String {
    seq.get().to_string()
}

/// Decode a cursor token into the sequence number to resume after.
///
/// `None`, malformed and negative tokens all decode to `0` (read from the
/// start); fractional tokens floor.
pub fn decode(cursor: Option<&str>) -> SequenceNumber {
    let text = match cursor {
        Some(text) => text,
        None => return SequenceNumber::new(0),
    };

    if let Ok(seq) = text.parse::<i64>() {
        return SequenceNumber::new(seq.max(0));
    }

    if let Ok(value) = text.parse::<f64>() {
        let floored = value.floor();
        if floored.is_finite() && floored >= 0.0 && floored <= i64::MAX as f64 {
            return SequenceNumber::new(floored as i64);
        }
    }

    SequenceNumber::new(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for seq in [0, 1, 7, 500, i64::MAX] {
            let seq = SequenceNumber::new(seq);
            assert_eq!(decode(Some(&encode(seq))), seq);
        }
    }

    #[test]
    fn missing_and_malformed_read_from_start() {
        assert_eq!(decode(None), SequenceNumber::new(0));
        assert_eq!(decode(Some("")), SequenceNumber::new(0));
        assert_eq!(decode(Some("garbage")), SequenceNumber::new(0));
        assert_eq!(decode(Some("12abc")), SequenceNumber::new(0));
        assert_eq!(decode(Some("NaN")), SequenceNumber::new(0));
    }

    #[test]
    fn negatives_are_rejected() {
        assert_eq!(decode(Some("-1")), SequenceNumber::new(0));
        assert_eq!(decode(Some("-100")), SequenceNumber::new(0));
        assert_eq!(decode(Some("-0.5")), SequenceNumber::new(0));
    }

    #[test]
    fn fractional_floors() {
        assert_eq!(decode(Some("3.9")), SequenceNumber::new(3));
        assert_eq!(decode(Some("3.0")), SequenceNumber::new(3));
        assert_eq!(decode(Some("0.2")), SequenceNumber::new(0));
    }
}
