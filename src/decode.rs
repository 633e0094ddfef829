//! Wire-frame decoding for engine trace buffers.
//!
//! Every record the engine writes is a fixed [`FrameHeader`] followed by the
//! clause's output fields, each a one-byte kind tag and a native-endian
//! payload (strings are u32 length-prefixed). Decoding is resumable: an
//! incomplete trailing frame is never an error, the unconsumed prefix is
//! simply carried in a [`DecodeCursor`] to the next drain cycle.

use plain::Plain;

use crate::compile::{CompiledProgram, OutputField};
use crate::errors::DecodeError;
use crate::record::{FieldKind, FieldValue, TraceRecord};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameHeader {
    pub cookie: u64,
    pub ts: u64,
    pub source: u32,
    pub size: u32,
}

unsafe impl Plain for FrameHeader {}

pub const FRAME_HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

const TAG_INTEGER: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_ADDRESS: u8 = 3;
const TAG_FLOAT: u8 = 4;

pub(crate) fn kind_tag(kind: FieldKind) -> u8 {
    match kind {
        FieldKind::Integer => TAG_INTEGER,
        FieldKind::String => TAG_STRING,
        FieldKind::Address => TAG_ADDRESS,
        FieldKind::Float => TAG_FLOAT,
    }
}

fn kind_from_tag(tag: u8) -> Option<FieldKind> {
    match tag {
        TAG_INTEGER => Some(FieldKind::Integer),
        TAG_STRING => Some(FieldKind::String),
        TAG_ADDRESS => Some(FieldKind::Address),
        TAG_FLOAT => Some(FieldKind::Float),
        _ => None,
    }
}

/// Unconsumed byte prefix carried between drain cycles for one source.
#[derive(Debug, Default)]
pub struct DecodeCursor {
    pub(crate) pending: Vec<u8>,
}

impl DecodeCursor {
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }
}

/// Decode the next complete frame from `bytes`.
///
/// Returns the record and the number of bytes consumed, or `None` when the
/// remaining bytes are an incomplete frame. Never reads past `bytes`.
pub fn next_record(
    program: &CompiledProgram,
    bytes: &[u8],
) -> Result<Option<(TraceRecord, usize)>, DecodeError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let mut header = FrameHeader::default();
    plain::copy_from_bytes(&mut header, bytes).expect("header length already checked");

    let total = FRAME_HEADER_SIZE + header.size as usize;
    if bytes.len() < total {
        return Ok(None);
    }

    let clause = program
        .clause_by_cookie(header.cookie)
        .ok_or(DecodeError::UnknownClause {
            cookie: header.cookie,
        })?;
    let payload = &bytes[FRAME_HEADER_SIZE..total];

    let mut offset = 0;
    let mut values = Vec::with_capacity(clause.outputs.len());
    for field in &clause.outputs {
        values.push(next_field(field, payload, &mut offset)?);
    }
    if offset != payload.len() {
        return Err(DecodeError::TrailingBytes {
            cookie: header.cookie,
            extra: payload.len() - offset,
        });
    }

    let record = TraceRecord {
        cookie: header.cookie,
        probe: clause.probe.to_string(),
        ts: header.ts,
        source: header.source,
        values,
    };
    Ok(Some((record, total)))
}

fn next_field(
    field: &OutputField,
    payload: &[u8],
    offset: &mut usize,
) -> Result<FieldValue, DecodeError> {
    let tag = *payload.get(*offset).ok_or_else(|| DecodeError::Truncated {
        field: field.name.clone(),
    })?;
    *offset += 1;
    let found = kind_from_tag(tag).ok_or(DecodeError::BadTag { tag })?;
    if found != field.kind {
        return Err(DecodeError::KindMismatch {
            field: field.name.clone(),
            expected: field.kind,
            found,
        });
    }
    match found {
        FieldKind::Integer => Ok(FieldValue::Integer(i64::from_ne_bytes(take(
            field, payload, offset,
        )?))),
        FieldKind::Address => Ok(FieldValue::Address(u64::from_ne_bytes(take(
            field, payload, offset,
        )?))),
        FieldKind::Float => Ok(FieldValue::Float(f64::from_ne_bytes(take(
            field, payload, offset,
        )?))),
        FieldKind::String => {
            let len = u32::from_ne_bytes(take(field, payload, offset)?) as usize;
            let bytes = payload
                .get(*offset..*offset + len)
                .ok_or_else(|| DecodeError::Truncated {
                    field: field.name.clone(),
                })?;
            *offset += len;
            Ok(FieldValue::String(
                String::from_utf8_lossy(bytes).into_owned(),
            ))
        }
    }
}

fn take<const N: usize>(
    field: &OutputField,
    payload: &[u8],
    offset: &mut usize,
) -> Result<[u8; N], DecodeError> {
    let bytes = payload
        .get(*offset..*offset + N)
        .ok_or_else(|| DecodeError::Truncated {
            field: field.name.clone(),
        })?;
    *offset += N;
    Ok(bytes.try_into().expect("slice length is fixed"))
}

/// Encode one record frame exactly as the engine writes it. Provider
/// implementations and tests use this to synthesize buffer contents.
pub fn encode_record(cookie: u64, ts: u64, source: u32, values: &[FieldValue]) -> Vec<u8> {
    let mut payload = Vec::new();
    for value in values {
        payload.push(kind_tag(value.kind()));
        match value {
            FieldValue::Integer(v) => payload.extend_from_slice(&v.to_ne_bytes()),
            FieldValue::Address(v) => payload.extend_from_slice(&v.to_ne_bytes()),
            FieldValue::Float(v) => payload.extend_from_slice(&v.to_ne_bytes()),
            FieldValue::String(s) => {
                payload.extend_from_slice(&(s.len() as u32).to_ne_bytes());
                payload.extend_from_slice(s.as_bytes());
            }
        }
    }
    let header = FrameHeader {
        cookie,
        ts,
        source,
        size: payload.len() as u32,
    };
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.extend_from_slice(unsafe { plain::as_bytes(&header) });
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::Clause;
    use crate::script::ProbeDesc;

    fn program() -> CompiledProgram {
        let clause = Clause {
            cookie: 7,
            probe: ProbeDesc::parse("ip:::send").unwrap(),
            predicate: None,
            format: Vec::new(),
            outputs: vec![
                OutputField {
                    name: "execname".to_string(),
                    kind: FieldKind::String,
                },
                OutputField {
                    name: "pid".to_string(),
                    kind: FieldKind::Integer,
                },
            ],
            aggregations: Vec::new(),
        };
        CompiledProgram::new(vec![clause])
    }

    fn values() -> Vec<FieldValue> {
        vec![
            FieldValue::String("bash".to_string()),
            FieldValue::Integer(100),
        ]
    }

    #[test]
    fn test_roundtrip() {
        let bytes = encode_record(7, 1234, 0, &values());
        let (record, used) = next_record(&program(), &bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(record.ts, 1234);
        assert_eq!(record.source, 0);
        assert_eq!(record.probe, "ip:::send");
        assert_eq!(record.values, values());
    }

    #[test]
    fn test_partial_frames_are_not_errors() {
        let bytes = encode_record(7, 1, 0, &values());
        // every split point short of the full frame decodes to "not yet"
        for split in 0..bytes.len() {
            assert!(next_record(&program(), &bytes[..split]).unwrap().is_none());
        }
    }

    #[test]
    fn test_split_decodes_like_unsplit() {
        let bytes = encode_record(7, 1, 0, &values());
        let (whole, _) = next_record(&program(), &bytes).unwrap().unwrap();

        let split = FRAME_HEADER_SIZE + 3;
        let mut pending = bytes[..split].to_vec();
        assert!(next_record(&program(), &pending).unwrap().is_none());
        pending.extend_from_slice(&bytes[split..]);
        let (resumed, _) = next_record(&program(), &pending).unwrap().unwrap();
        assert_eq!(resumed, whole);
    }

    #[test]
    fn test_unknown_cookie() {
        let bytes = encode_record(99, 1, 0, &values());
        assert!(matches!(
            next_record(&program(), &bytes),
            Err(DecodeError::UnknownClause { cookie: 99 })
        ));
    }

    #[test]
    fn test_kind_mismatch() {
        // integer where the layout wants a string
        let bytes = encode_record(
            7,
            1,
            0,
            &[FieldValue::Integer(1), FieldValue::Integer(100)],
        );
        assert!(matches!(
            next_record(&program(), &bytes),
            Err(DecodeError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_tag() {
        let mut bytes = encode_record(7, 1, 0, &values());
        bytes[FRAME_HEADER_SIZE] = 0xee;
        assert!(matches!(
            next_record(&program(), &bytes),
            Err(DecodeError::BadTag { tag: 0xee })
        ));
    }

    #[test]
    fn test_trailing_bytes_in_frame() {
        let mut bytes = encode_record(7, 1, 0, &values());
        // grow the declared payload without declaring another field
        let size = FRAME_HEADER_SIZE - 4;
        let declared = u32::from_ne_bytes(bytes[size..size + 4].try_into().unwrap());
        bytes[size..size + 4].copy_from_slice(&(declared + 2).to_ne_bytes());
        bytes.extend_from_slice(&[0, 0]);
        assert!(matches!(
            next_record(&program(), &bytes),
            Err(DecodeError::TrailingBytes { extra: 2, .. })
        ));
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut bytes = encode_record(7, 1, 0, &values());
        bytes.extend_from_slice(&encode_record(7, 2, 0, &values()));
        let (first, used) = next_record(&program(), &bytes).unwrap().unwrap();
        let (second, _) = next_record(&program(), &bytes[used..]).unwrap().unwrap();
        assert_eq!(first.ts, 1);
        assert_eq!(second.ts, 2);
    }
}
