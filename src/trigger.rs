//! Wire forms of the PLC trigger and their validation.
//!
//! Two encodings arrive at the listener: the ASCII datagram form
//! `ip,MMDDYYYY,error,secret` and the fixed-layout binary stream form
//! (4 B IPv4 · 4 B big-endian epoch seconds · 8 B NUL-padded error code ·
//! NUL-padded secret remainder). Both normalise to a [`TriggerMessage`] with
//! an ISO-8601 fault timestamp. Encoders for both forms live here too, so
//! the PLC side of the protocol can be exercised in tests.

use std::io::Cursor;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// Result of trigger parsing and validation.
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length of the error-code and shared-secret fields.
pub const MAX_FIELD_LEN: usize = 48;

/// Offset of the secret in the binary stream form.
const STREAM_SECRET_OFFSET: usize = 16;

/// Length the binary encoder pads the secret field to.
const STREAM_SECRET_LEN: usize = MAX_FIELD_LEN;

/// Why a trigger was rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Field count or frame length does not match the wire form.
    Layout,
    /// Payload is not the ASCII subset the form requires.
    Encoding,
    /// The IP field does not parse as an IPv4 literal.
    Ip,
    /// The date field is not 7 or 8 digits of a real `MMDDYYYY` date.
    Date,
    /// The epoch field of the binary form is out of range.
    Timestamp,
    /// The error code is too long or not alphanumeric.
    ErrorCode,
    /// The secret is too long, has a char outside the allow-set, or does
    /// not match the expected secret.
    Secret,
}

/// A validated trigger, normalised from either wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMessage {
    pub ip: Ipv4Addr,
    pub datetime: NaiveDateTime,
    pub error_code: String,
}

impl TriggerMessage {
    /// Fault timestamp in the ISO-8601 form used for event ids.
    pub fn iso_datetime(&self) -> String {
        self.datetime.format("%Y-%m-%dT%H:%M:%S").to_string()
    }
}

/// Field rules shared by both wire forms, bound to the configured secret and
/// the extra characters the secret may contain beyond alphanumerics.
pub struct Validator {
    expected_secret: String,
    allowed_chars: String,
}

impl Validator {
    pub fn new(expected_secret: impl Into<String>, allowed_chars: impl Into<String>) -> Self {
        Self { expected_secret: expected_secret.into(), allowed_chars: allowed_chars.into() }
    }

    /// Parses and validates the ASCII datagram form.
    pub fn parse_datagram(&self, payload: &[u8]) -> Result<TriggerMessage> {
        let text = std::str::from_utf8(payload).map_err(|_| Error::Encoding)?;
        let text = text.trim_end_matches(['\r', '\n']);
        let mut parts = text.split(',');
        let (ip, date, error_code, secret) =
            match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(ip), Some(date), Some(erc), Some(secret), None) => (ip, date, erc, secret),
                _ => return Err(Error::Layout),
            };

        let ip: Ipv4Addr = ip.parse().map_err(|_| Error::Ip)?;
        let date = parse_compact_date(date)?;
        self.check_error_code(error_code)?;
        self.check_secret(secret)?;

        Ok(TriggerMessage {
            ip,
            // The datagram form carries a date only; the fault time is
            // midnight of that day.
            datetime: date.and_hms_opt(0, 0, 0).ok_or(Error::Date)?,
            error_code: error_code.to_owned(),
        })
    }

    /// Parses and validates the binary stream form. The epoch field is
    /// checked as a timestamp in its own right rather than being forced
    /// through the ASCII date rule.
    pub fn parse_stream(&self, payload: &[u8]) -> Result<TriggerMessage> {
        if payload.len() < STREAM_SECRET_OFFSET {
            return Err(Error::Layout);
        }
        let mut src = Cursor::new(payload);
        let mut ip = [0u8; 4];
        for octet in &mut ip {
            *octet = src.read_u8().map_err(|_| Error::Layout)?;
        }
        let epoch = src.read_u32::<BigEndian>().map_err(|_| Error::Layout)?;

        let error_code = padded_ascii(&payload[8..STREAM_SECRET_OFFSET])?;
        let secret = padded_ascii(&payload[STREAM_SECRET_OFFSET..])?;
        self.check_error_code(error_code)?;
        self.check_secret(secret)?;

        let datetime =
            DateTime::from_timestamp(i64::from(epoch), 0).ok_or(Error::Timestamp)?.naive_utc();

        Ok(TriggerMessage { ip: Ipv4Addr::from(ip), datetime, error_code: error_code.to_owned() })
    }

    fn check_error_code(&self, erc: &str) -> Result<()> {
        if erc.is_empty()
            || erc.len() > MAX_FIELD_LEN
            || !erc.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(Error::ErrorCode);
        }
        Ok(())
    }

    fn check_secret(&self, secret: &str) -> Result<()> {
        let well_formed = secret.len() <= MAX_FIELD_LEN
            && secret
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || self.allowed_chars.contains(c));
        if !well_formed || secret != self.expected_secret {
            return Err(Error::Secret);
        }
        Ok(())
    }
}

/// `MMDDYYYY`, with a 7-digit value left-padded to a single-digit month.
fn parse_compact_date(date: &str) -> Result<NaiveDate> {
    if !matches!(date.len(), 7 | 8) || !date.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::Date);
    }
    let padded = if date.len() == 7 { format!("0{date}") } else { date.to_owned() };
    NaiveDate::parse_from_str(&padded, "%m%d%Y").map_err(|_| Error::Date)
}

/// Decodes a NUL-padded ASCII field of the binary form.
fn padded_ascii(field: &[u8]) -> Result<&str> {
    let text = std::str::from_utf8(field).map_err(|_| Error::Encoding)?;
    Ok(text.trim_matches('\0'))
}

/// Encodes the ASCII datagram form.
pub fn encode_datagram(ip: Ipv4Addr, date: NaiveDate, error_code: &str, secret: &str) -> Vec<u8> {
    format!("{ip},{},{error_code},{secret}\n", date.format("%m%d%Y")).into_bytes()
}

/// Encodes the binary stream form.
pub fn encode_stream(ip: Ipv4Addr, epoch: u32, error_code: &str, secret: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(STREAM_SECRET_OFFSET + STREAM_SECRET_LEN);
    out.extend_from_slice(&ip.octets());
    out.write_u32::<BigEndian>(epoch).expect("vec write");
    out.extend_from_slice(error_code.as_bytes());
    out.resize(STREAM_SECRET_OFFSET, 0);
    out.extend_from_slice(secret.as_bytes());
    out.resize(STREAM_SECRET_OFFSET + STREAM_SECRET_LEN, 0);
    out
}
