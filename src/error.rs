use std::fmt;

/// Crate-wide error taxonomy.
#[derive(Debug)]
pub enum Error {
    /// Malformed packet: bad type code, bad timestamp tag, truncated varint.
    Format(FormatError),
    /// Declared length exceeds buffer, fragment overflow.
    Length(&'static str),
    /// CRC-16 mismatch after decrypt.
    Crc { expected: u16, actual: u16 },
    /// Negative assignment to an ENUM datapoint.
    EnumValue,
    /// Non-zero result byte in a response.
    Device(u8),
    /// Underlying BLE transport failure.
    Transport(Box<dyn std::error::Error + Send + Sync>),
    /// Response not received within the configured timeout.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    UnknownDataPointType(u8),
    UnknownTimestampTag(u8),
    TruncatedVarint,
    InvalidUtf8,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Format(e) => write!(f, "format error: {e}"),
            Error::Length(msg) => write!(f, "length error: {msg}"),
            Error::Crc { expected, actual } => {
                write!(f, "CRC mismatch: expected {expected:#06x}, got {actual:#06x}")
            }
            Error::EnumValue => write!(f, "enum datapoint value must be non-negative"),
            Error::Device(code) => write!(f, "device returned error code {code}"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Timeout => write!(f, "timed out waiting for response"),
        }
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::UnknownDataPointType(t) => write!(f, "unknown datapoint type code {t}"),
            FormatError::UnknownTimestampTag(t) => write!(f, "unknown timestamp tag {t}"),
            FormatError::TruncatedVarint => write!(f, "truncated varint"),
            FormatError::InvalidUtf8 => write!(f, "invalid UTF-8 in STRING datapoint"),
        }
    }
}

impl std::error::Error for Error {}
impl std::error::Error for FormatError {}

impl From<FormatError> for Error {
    fn from(e: FormatError) -> Self {
        Error::Format(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
