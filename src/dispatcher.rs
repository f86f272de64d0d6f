//! Inbound dispatcher: opcode-based routing for device-originated messages,
//! auto-reply construction for time-sync requests.
//!
//! Timezone fields are packed in hundredths-of-hours, negated from the
//! local UTC offset.

use crate::datapoint::{parse_block, DataPointUpdate};
use crate::error::{Error, FormatError};
use crate::opcode::{self, Opcode};

/// Seconds-since-epoch timestamp plus how many bytes of the payload it
/// consumed, including the leading tag byte.
struct ParsedTimestamp {
    seconds: u32,
    consumed: usize,
}

/// Tag `0x00` -> 13 ASCII digits of milliseconds-since-epoch; tag `0x01`
/// -> 4 bytes big-endian unsigned seconds.
fn parse_timestamp(payload: &[u8]) -> Result<ParsedTimestamp, Error> {
    let tag = *payload.first().ok_or(Error::Length("empty timestamp payload"))?;
    match tag {
        0x00 => {
            if payload.len() < 14 {
                return Err(Error::Length("truncated millisecond timestamp"));
            }
            let digits = std::str::from_utf8(&payload[1..14]).map_err(|_| FormatError::InvalidUtf8)?;
            let millis: u64 = digits.parse().map_err(|_| FormatError::InvalidUtf8)?;
            Ok(ParsedTimestamp {
                seconds: (millis / 1000) as u32,
                consumed: 14,
            })
        }
        0x01 => {
            if payload.len() < 5 {
                return Err(Error::Length("truncated second timestamp"));
            }
            let seconds = u32::from_be_bytes(payload[1..5].try_into().unwrap());
            Ok(ParsedTimestamp { seconds, consumed: 5 })
        }
        other => Err(FormatError::UnknownTimestampTag(other).into()),
    }
}

/// Result of handling one device-originated message: any datapoint
/// updates it carried, and the ack to send back (if any), as `(opcode,
/// body)` to be sent with `response_to` set to the inbound `seq_num`.
pub struct DispatchOutcome {
    pub datapoints: Vec<DataPointUpdate>,
    pub ack: Option<(Opcode, Vec<u8>)>,
}

impl DispatchOutcome {
    fn datapoints_only(datapoints: Vec<DataPointUpdate>, ack_opcode: Opcode) -> Self {
        DispatchOutcome {
            datapoints,
            ack: Some((ack_opcode, Vec::new())),
        }
    }
}

/// Handle one device-originated message (opcode >= `0x8000`). `now_ms` and
/// `utc_offset_seconds` (east-positive) are supplied by the caller so this
/// function stays pure and independently testable.
pub fn handle_unsolicited(
    opcode: Opcode,
    body: &[u8],
    now_ms: u64,
    utc_offset_seconds: i32,
    local_time: LocalTimeFields,
) -> Result<DispatchOutcome, Error> {
    match opcode {
        opcode::RECEIVE_DP => {
            let datapoints = parse_block(body)?;
            Ok(DispatchOutcome::datapoints_only(datapoints, opcode))
        }
        opcode::RECEIVE_TIME_DP => {
            let ts = parse_timestamp(body)?;
            let datapoints = parse_block(&body[ts.consumed..])?;
            Ok(DispatchOutcome::datapoints_only(datapoints, opcode))
        }
        opcode::RECEIVE_SIGN_DP => {
            if body.len() < 3 {
                return Err(Error::Length("RECEIVE_SIGN_DP body shorter than header"));
            }
            let dp_seq = u16::from_be_bytes([body[0], body[1]]);
            let flags = body[2];
            let datapoints = parse_block(&body[3..])?;
            let ack_body = sign_ack_body(dp_seq, flags);
            Ok(DispatchOutcome {
                datapoints,
                ack: Some((opcode, ack_body)),
            })
        }
        opcode::RECEIVE_SIGN_TIME_DP => {
            if body.len() < 3 {
                return Err(Error::Length("RECEIVE_SIGN_TIME_DP body shorter than header"));
            }
            let dp_seq = u16::from_be_bytes([body[0], body[1]]);
            let flags = body[2];
            let ts = parse_timestamp(&body[3..])?;
            let datapoints = parse_block(&body[3 + ts.consumed..])?;
            let ack_body = sign_ack_body(dp_seq, flags);
            Ok(DispatchOutcome {
                datapoints,
                ack: Some((opcode, ack_body)),
            })
        }
        opcode::RECEIVE_TIME1_REQ => {
            let body = build_time1_reply(now_ms, utc_offset_seconds);
            Ok(DispatchOutcome {
                datapoints: Vec::new(),
                ack: Some((opcode, body)),
            })
        }
        opcode::RECEIVE_TIME2_REQ => {
            let body = build_time2_reply(utc_offset_seconds, local_time);
            Ok(DispatchOutcome {
                datapoints: Vec::new(),
                ack: Some((opcode, body)),
            })
        }
        _ => Ok(DispatchOutcome {
            datapoints: Vec::new(),
            ack: None,
        }),
    }
}

fn sign_ack_body(dp_seq: u16, flags: u8) -> Vec<u8> {
    let mut body = Vec::with_capacity(4);
    body.extend_from_slice(&dp_seq.to_be_bytes());
    body.push(flags);
    body.push(0);
    body
}

fn timezone_field(utc_offset_seconds: i32) -> i16 {
    (-(utc_offset_seconds / 36)) as i16
}

/// `RECEIVE_TIME1_REQ` reply body: ASCII decimal ms-since-epoch followed
/// by a big-endian `i16` timezone in hundredths of hours, negated from the
/// local offset.
fn build_time1_reply(now_ms: u64, utc_offset_seconds: i32) -> Vec<u8> {
    let mut body = now_ms.to_string().into_bytes();
    body.extend_from_slice(&timezone_field(utc_offset_seconds).to_be_bytes());
    body
}

/// Local wall-clock fields for `RECEIVE_TIME2_REQ`, supplied by the caller
/// (this module has no calendar dependency of its own).
#[derive(Debug, Clone, Copy)]
pub struct LocalTimeFields {
    pub year_in_century: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub weekday: u8,
}

/// `RECEIVE_TIME2_REQ` reply body: `(yy, mm, dd, HH, MM, SS, wday, tz:i16)`,
/// each field one byte except the trailing big-endian `i16` timezone.
fn build_time2_reply(utc_offset_seconds: i32, fields: LocalTimeFields) -> Vec<u8> {
    let mut body = vec![
        fields.year_in_century,
        fields.month,
        fields.day,
        fields.hour,
        fields.minute,
        fields.second,
        fields.weekday,
    ];
    body.extend_from_slice(&timezone_field(utc_offset_seconds).to_be_bytes());
    body
}
