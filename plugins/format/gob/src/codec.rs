use std::collections::HashMap;

use relay_api::{Envelope, EnvelopeCodec, MAX_DATAGRAM_SIZE, RelayError};

use super::wire::{Reader, put_bytes, put_int, put_uint};

// Встроенные gob type id.
const T_BOOL: i64 = 1;
const T_INT: i64 = 2;
const T_UINT: i64 = 3;
const T_FLOAT: i64 = 4;
const T_BYTES: i64 = 5;
const T_STRING: i64 = 6;

/// Первый пользовательский type id, который выдаёт Go-процесс.
const MESSAGE_TYPE_ID: i64 = 65;

const TYPE_NAME: &str = "Message";
const FIELD_CHANNEL: &str = "Channel";
const FIELD_MEASUREMENT: &str = "Measurement";
const FIELD_TIMESTAMP: &str = "Timestamp";

// wireType: ArrayT, SliceT, StructT, ...
const WIRE_STRUCT_T: i64 = 2;

// ═══════════════════════════════════════════════════════════════
//  GobCodec
// ═══════════════════════════════════════════════════════════════

/// Envelope в формате Go `encoding/gob`, байт в байт как
/// `gob.NewEncoder(&buf).Encode(Message{...})`: сообщение с описанием
/// типа, затем сообщение со значением. Каждая датаграмма самодостаточна.
pub struct GobCodec {
    max_size: usize,
}

impl Default for GobCodec {
    fn default() -> Self {
        Self::new(MAX_DATAGRAM_SIZE)
    }
}

impl GobCodec {
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl EnvelopeCodec for GobCodec {
    fn name(&self) -> &'static str {
        "gob"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, RelayError> {
        let mut out = Vec::with_capacity(128 + envelope.channel.len() + envelope.measurement.len());
        put_message(&mut out, &type_definition());
        put_message(&mut out, &value_message(envelope));

        if out.len() > self.max_size {
            return Err(RelayError::OversizedPayload {
                size: out.len(),
                limit: self.max_size,
            });
        }
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Envelope, RelayError> {
        if data.len() > self.max_size {
            return Err(RelayError::decode(format!(
                "gob: datagram is {} bytes, limit is {}",
                data.len(),
                self.max_size
            )));
        }
        decode_stream(data)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Encoding
// ═══════════════════════════════════════════════════════════════

fn put_message(out: &mut Vec<u8>, body: &[u8]) {
    put_uint(out, body.len() as u64);
    out.extend_from_slice(body);
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Описание `struct Message { Channel string; Measurement []byte; Timestamp int64 }`.
fn type_definition() -> Vec<u8> {
    let mut b = Vec::with_capacity(64);
    put_int(&mut b, -MESSAGE_TYPE_ID);

    // wireType.StructT
    put_uint(&mut b, (WIRE_STRUCT_T + 1) as u64);
    // structType.CommonType
    put_uint(&mut b, 1);
    put_uint(&mut b, 1);
    put_string(&mut b, TYPE_NAME);
    put_uint(&mut b, 1);
    put_int(&mut b, MESSAGE_TYPE_ID);
    put_uint(&mut b, 0);
    // structType.Field
    put_uint(&mut b, 1);
    let fields = [
        (FIELD_CHANNEL, T_STRING),
        (FIELD_MEASUREMENT, T_BYTES),
        (FIELD_TIMESTAMP, T_INT),
    ];
    put_uint(&mut b, fields.len() as u64);
    for (name, id) in fields {
        put_uint(&mut b, 1);
        put_string(&mut b, name);
        put_uint(&mut b, 1);
        put_int(&mut b, id);
        put_uint(&mut b, 0);
    }
    // end structType, end wireType
    put_uint(&mut b, 0);
    put_uint(&mut b, 0);
    b
}

/// Значение: дельты номеров полей, нулевые поля пропускаются.
fn value_message(envelope: &Envelope) -> Vec<u8> {
    let mut b = Vec::with_capacity(16 + envelope.channel.len() + envelope.measurement.len());
    put_int(&mut b, MESSAGE_TYPE_ID);

    let mut last: i64 = -1;
    let mut field = |b: &mut Vec<u8>, index: i64| {
        put_uint(b, (index - last) as u64);
        last = index;
    };

    if !envelope.channel.is_empty() {
        field(&mut b, 0);
        put_string(&mut b, &envelope.channel);
    }
    if !envelope.measurement.is_empty() {
        field(&mut b, 1);
        put_bytes(&mut b, &envelope.measurement);
    }
    if envelope.timestamp != 0 {
        field(&mut b, 2);
        put_int(&mut b, envelope.timestamp);
    }
    put_uint(&mut b, 0);
    b
}

// ═══════════════════════════════════════════════════════════════
//  Decoding
// ═══════════════════════════════════════════════════════════════

struct FieldDef {
    name: String,
    type_id: i64,
}

/// Читает сообщения по порядку: описания типов (id < 0) запоминаются,
/// первое значение (id > 0) декодируется в Envelope.
fn decode_stream(data: &[u8]) -> Result<Envelope, RelayError> {
    let mut stream = Reader::new(data);
    let mut types: HashMap<i64, Vec<FieldDef>> = HashMap::new();

    loop {
        if stream.is_empty() || stream.only_padding_left() {
            return Err(RelayError::decode("gob: no value message in datagram"));
        }
        let len = stream.length()?;
        let mut msg = Reader::new(stream.take(len)?);
        let id = msg.int()?;

        if id < 0 {
            let type_id = id
                .checked_neg()
                .ok_or_else(|| RelayError::decode("gob: type id out of range"))?;
            let fields = read_type_definition(&mut msg, type_id)?;
            types.insert(type_id, fields);
        } else if id == 0 {
            return Err(RelayError::decode("gob: value is not a struct"));
        } else {
            let fields = types
                .get(&id)
                .ok_or_else(|| RelayError::decode(format!("gob: unknown type id {id}")))?;
            let envelope = read_value(&mut msg, fields)?;
            if !msg.is_empty() {
                return Err(RelayError::decode("gob: trailing bytes in value message"));
            }
            return Ok(envelope);
        }
        if !msg.is_empty() {
            return Err(RelayError::decode("gob: trailing bytes in type message"));
        }
    }
}

/// Следующий номер поля или None на конце структуры.
fn next_field(r: &mut Reader<'_>, current: &mut i64) -> Result<Option<i64>, RelayError> {
    let delta = r.uint()?;
    if delta == 0 {
        return Ok(None);
    }
    if delta > i64::MAX as u64 || *current > i64::MAX - delta as i64 {
        return Err(RelayError::decode("gob: field delta overflow"));
    }
    *current += delta as i64;
    Ok(Some(*current))
}

fn read_type_definition(r: &mut Reader<'_>, expected_id: i64) -> Result<Vec<FieldDef>, RelayError> {
    let mut field = -1;
    let mut result = None;
    while let Some(n) = next_field(r, &mut field)? {
        if n != WIRE_STRUCT_T {
            return Err(RelayError::decode(format!("gob: unsupported wire type (field {n})")));
        }
        result = Some(read_struct_type(r, expected_id)?);
    }
    result.ok_or_else(|| RelayError::decode("gob: empty type definition"))
}

fn read_struct_type(r: &mut Reader<'_>, expected_id: i64) -> Result<Vec<FieldDef>, RelayError> {
    let mut field = -1;
    let mut fields = Vec::new();
    while let Some(n) = next_field(r, &mut field)? {
        match n {
            0 => {
                // CommonType { Name, Id }
                let mut common = -1;
                while let Some(c) = next_field(r, &mut common)? {
                    match c {
                        0 => {
                            r.string()?;
                        }
                        1 => {
                            let id = r.int()?;
                            if id != expected_id {
                                return Err(RelayError::decode(format!(
                                    "gob: type id mismatch ({id} != {expected_id})"
                                )));
                            }
                        }
                        _ => return Err(RelayError::decode("gob: bad CommonType field")),
                    }
                }
            }
            1 => {
                let count = r.length()?;
                for _ in 0..count {
                    fields.push(read_field_type(r)?);
                }
            }
            _ => return Err(RelayError::decode("gob: bad structType field")),
        }
    }
    Ok(fields)
}

fn read_field_type(r: &mut Reader<'_>) -> Result<FieldDef, RelayError> {
    let mut field = -1;
    let mut name = String::new();
    let mut type_id = 0;
    while let Some(n) = next_field(r, &mut field)? {
        match n {
            0 => name = r.string()?.to_string(),
            1 => type_id = r.int()?,
            _ => return Err(RelayError::decode("gob: bad fieldType field")),
        }
    }
    Ok(FieldDef { name, type_id })
}

fn expect_type(def: &FieldDef, type_id: i64) -> Result<(), RelayError> {
    if def.type_id != type_id {
        return Err(RelayError::decode(format!(
            "gob: field {} has type id {}, expected {type_id}",
            def.name, def.type_id
        )));
    }
    Ok(())
}

fn read_value(r: &mut Reader<'_>, fields: &[FieldDef]) -> Result<Envelope, RelayError> {
    let mut envelope = Envelope::new(String::new(), Vec::new(), 0);
    let mut field = -1;
    while let Some(n) = next_field(r, &mut field)? {
        let def = usize::try_from(n)
            .ok()
            .and_then(|i| fields.get(i))
            .ok_or_else(|| RelayError::decode(format!("gob: field number {n} out of range")))?;

        match def.name.as_str() {
            FIELD_CHANNEL => {
                expect_type(def, T_STRING)?;
                envelope.channel = r.string()?.to_string();
            }
            FIELD_MEASUREMENT => {
                expect_type(def, T_BYTES)?;
                envelope.measurement = r.bytes()?.to_vec();
            }
            FIELD_TIMESTAMP => {
                expect_type(def, T_INT)?;
                envelope.timestamp = r.int()?;
            }
            _ => skip_builtin(r, def)?,
        }
    }
    Ok(envelope)
}

/// Пропустить неизвестное поле встроенного типа.
fn skip_builtin(r: &mut Reader<'_>, def: &FieldDef) -> Result<(), RelayError> {
    match def.type_id {
        T_BOOL | T_INT | T_UINT | T_FLOAT => {
            r.uint()?;
        }
        T_BYTES | T_STRING => {
            r.bytes()?;
        }
        other => {
            return Err(RelayError::decode(format!(
                "gob: cannot skip field {} of type id {other}",
                def.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Вывод Go для `Message{Channel: "a", Measurement: []byte{1, 2, 3}, Timestamp: 100}`.
    fn go_bytes() -> Vec<u8> {
        let mut v = vec![0x3f, 0xff, 0x81, 0x03, 0x01, 0x01, 0x07];
        v.extend_from_slice(b"Message");
        v.extend_from_slice(&[0x01, 0xff, 0x82, 0x00, 0x01, 0x03]);
        v.extend_from_slice(&[0x01, 0x07]);
        v.extend_from_slice(b"Channel");
        v.extend_from_slice(&[0x01, 0x0c, 0x00]);
        v.extend_from_slice(&[0x01, 0x0b]);
        v.extend_from_slice(b"Measurement");
        v.extend_from_slice(&[0x01, 0x0a, 0x00]);
        v.extend_from_slice(&[0x01, 0x09]);
        v.extend_from_slice(b"Timestamp");
        v.extend_from_slice(&[0x01, 0x04, 0x00]);
        v.extend_from_slice(&[0x00, 0x00]);
        v.extend_from_slice(&[
            0x0e, 0xff, 0x82, 0x01, 0x01, b'a', 0x01, 0x03, 0x01, 0x02, 0x03, 0x01, 0xff, 0xc8, 0x00,
        ]);
        v
    }

    #[test]
    fn encodes_like_go() {
        let codec = GobCodec::default();
        let bytes = codec.encode(&Envelope::new("a", vec![1, 2, 3], 100)).unwrap();
        assert_eq!(bytes, go_bytes());
    }

    #[test]
    fn decodes_go_output() {
        let codec = GobCodec::default();
        let env = codec.decode(&go_bytes()).unwrap();
        assert_eq!(env, Envelope::new("a", vec![1, 2, 3], 100));
    }

    #[test]
    fn round_trip() {
        let codec = GobCodec::default();
        let cases = [
            Envelope::new("position_updates", b"{\"x\":1,\"y\":2}".to_vec(), 1_700_000_000_000),
            Envelope::new("map_updates", vec![0u8; 600], -42),
            Envelope::new("", Vec::new(), 0),
            Envelope::new("b", vec![9, 9], i64::MIN),
        ];
        for env in cases {
            let bytes = codec.encode(&env).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), env);
        }
    }

    #[test]
    fn zero_padding_after_message_is_ignored() {
        let codec = GobCodec::default();
        let mut bytes = go_bytes();
        bytes.resize(MAX_DATAGRAM_SIZE, 0);
        assert_eq!(codec.decode(&bytes).unwrap().channel, "a");
    }

    #[test]
    fn oversized_envelope_is_rejected() {
        let codec = GobCodec::default();
        let env = Envelope::new("a", vec![7u8; MAX_DATAGRAM_SIZE], 1);
        match codec.encode(&env) {
            Err(RelayError::OversizedPayload { size, limit }) => {
                assert!(size > limit);
                assert_eq!(limit, MAX_DATAGRAM_SIZE);
            }
            other => panic!("expected OversizedPayload, got {other:?}"),
        }
    }

    #[test]
    fn largest_payload_that_fits() {
        let codec = GobCodec::default();
        // 300..=1024 байт: префиксы длины одного размера (3 байта)
        let overhead = codec.encode(&Envelope::new("a", vec![1u8; 300], 1)).unwrap().len() - 300;
        let fits = Envelope::new("a", vec![1u8; MAX_DATAGRAM_SIZE - overhead], 1);
        assert_eq!(codec.encode(&fits).unwrap().len(), MAX_DATAGRAM_SIZE);
        let too_big = Envelope::new("a", vec![1u8; MAX_DATAGRAM_SIZE - overhead + 1], 1);
        assert!(codec.encode(&too_big).is_err());
    }

    #[test]
    fn truncated_datagram_fails() {
        let codec = GobCodec::default();
        let bytes = go_bytes();
        for cut in [1, 10, bytes.len() - 1] {
            assert!(
                matches!(codec.decode(&bytes[..cut]), Err(RelayError::Decode(_))),
                "cut at {cut} must fail"
            );
        }
    }

    #[test]
    fn garbage_fails() {
        let codec = GobCodec::default();
        assert!(codec.decode(b"hello world").is_err());
        assert!(codec.decode(&[]).is_err());
        assert!(codec.decode(&[0u8; 32]).is_err());
    }

    #[test]
    fn value_without_type_definition_fails() {
        let codec = GobCodec::default();
        let bytes = go_bytes();
        // только второе сообщение
        let value = &bytes[bytes.len() - 15..];
        assert!(matches!(codec.decode(value), Err(RelayError::Decode(_))));
    }

    #[test]
    fn wrong_field_type_fails() {
        let codec = GobCodec::default();
        let mut bytes = go_bytes();
        // Channel: string(0x0c) → int(0x04)
        let pos = bytes.windows(7).position(|w| w == b"Channel").unwrap() + 8;
        assert_eq!(bytes[pos], 0x0c);
        bytes[pos] = 0x04;
        assert!(codec.decode(&bytes).is_err());
    }
}
