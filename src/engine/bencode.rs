//! Bencode codec for the engine control channel.
//!
//! The engine frames every control payload as a bencoded dictionary. The
//! response side is dynamically typed, so the decoded tree is modelled as a
//! tagged [`Value`] and consumers extract fields with explicit type guards
//! instead of carrying raw bytes around.

use std::collections::BTreeMap;
use std::fmt;

/// Dictionary payload of a control request or response.
pub type Dict = BTreeMap<String, Value>;

/// One bencoded value: integer, byte string, list or dictionary.
///
/// Dictionary keys are required to be UTF-8; the engine only ever emits ASCII
/// keys. Values stay as raw bytes until a consumer asks for text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Dict),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Field lookup on a dictionary value; `None` for any other shape.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Lossy conversion into JSON for the operator-facing HTTP surface.
    /// Byte strings that are not valid UTF-8 are replaced, not dropped.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Bytes(b) => serde_json::Value::from(String::from_utf8_lossy(b).into_owned()),
            Value::List(l) => serde_json::Value::Array(l.iter().map(Value::to_json).collect()),
            Value::Dict(d) => serde_json::Value::Object(
                d.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(s.into_bytes())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

/// Decoding failure with a byte offset into the input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid bencode at byte {offset}: {reason}")]
pub struct DecodeError {
    pub offset: usize,
    pub reason: DecodeReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeReason {
    UnexpectedEnd,
    UnexpectedByte(u8),
    InvalidInteger,
    InvalidLength,
    NonUtf8Key,
}

impl fmt::Display for DecodeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeReason::UnexpectedEnd => write!(f, "unexpected end of input"),
            DecodeReason::UnexpectedByte(b) => write!(f, "unexpected byte {b:#04x}"),
            DecodeReason::InvalidInteger => write!(f, "invalid integer"),
            DecodeReason::InvalidLength => write!(f, "invalid string length"),
            DecodeReason::NonUtf8Key => write!(f, "dictionary key is not UTF-8"),
        }
    }
}

/// Encode a value into a fresh buffer.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    encode_into(&mut out, value);
    out
}

/// Encode a value, appending to `out`. Dictionary keys come out in sorted
/// order because [`Dict`] is a `BTreeMap`.
pub fn encode_into(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(l) => {
            out.push(b'l');
            for item in l {
                encode_into(out, item);
            }
            out.push(b'e');
        }
        Value::Dict(d) => {
            out.push(b'd');
            for (key, item) in d {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key.as_bytes());
                encode_into(out, item);
            }
            out.push(b'e');
        }
    }
}

/// Decode one value from the front of `input`. Trailing bytes are ignored;
/// the datagram boundary already delimits the payload.
pub fn decode(input: &[u8]) -> Result<Value, DecodeError> {
    let mut parser = Parser { input, pos: 0 };
    parser.value()
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn fail(&self, reason: DecodeReason) -> DecodeError {
        DecodeError {
            offset: self.pos,
            reason,
        }
    }

    fn peek(&self) -> Result<u8, DecodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.fail(DecodeReason::UnexpectedEnd))
    }

    fn value(&mut self) -> Result<Value, DecodeError> {
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            other => Err(self.fail(DecodeReason::UnexpectedByte(other))),
        }
    }

    fn integer(&mut self) -> Result<Value, DecodeError> {
        self.pos += 1; // 'i'
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.input[start..self.pos];
        self.pos += 1; // 'e'
        let text =
            std::str::from_utf8(digits).map_err(|_| self.fail(DecodeReason::InvalidInteger))?;
        let n: i64 = text
            .parse()
            .map_err(|_| self.fail(DecodeReason::InvalidInteger))?;
        Ok(Value::Int(n))
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, DecodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.input[self.pos].is_ascii_digit() {
                return Err(self.fail(DecodeReason::InvalidLength));
            }
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| self.fail(DecodeReason::InvalidLength))?;
        let len: usize = text
            .parse()
            .map_err(|_| self.fail(DecodeReason::InvalidLength))?;
        self.pos += 1; // ':'
        if self.input.len() - self.pos < len {
            return Err(self.fail(DecodeReason::UnexpectedEnd));
        }
        let bytes = self.input[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self) -> Result<Value, DecodeError> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value()?);
        }
        self.pos += 1; // 'e'
        Ok(Value::List(items))
    }

    fn dict(&mut self) -> Result<Value, DecodeError> {
        self.pos += 1; // 'd'
        let mut map = Dict::new();
        while self.peek()? != b'e' {
            let key_bytes = self.byte_string()?;
            let key =
                String::from_utf8(key_bytes).map_err(|_| self.fail(DecodeReason::NonUtf8Key))?;
            let value = self.value()?;
            map.insert(key, value);
        }
        self.pos += 1; // 'e'
        Ok(Value::Dict(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    #[test]
    fn encodes_sorted_keys() {
        let v = dict(vec![
            ("zulu", Value::from(1)),
            ("alpha", Value::from("x")),
        ]);
        assert_eq!(encode(&v), b"d5:alpha1:x4:zului1ee");
    }

    #[test]
    fn decodes_nested_structures() {
        let input = b"d5:callsl6:call-a6:call-be6:result2:oke";
        let v = decode(input).unwrap();
        let calls = v.get("calls").and_then(Value::as_list).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].as_str(), Some("call-a"));
        assert_eq!(v.get("result").and_then(Value::as_str), Some("ok"));
    }

    #[test]
    fn decodes_negative_integers() {
        assert_eq!(decode(b"i-42e").unwrap(), Value::Int(-42));
    }

    #[test]
    fn ignores_trailing_bytes() {
        assert_eq!(decode(b"i7etrailing").unwrap(), Value::Int(7));
    }

    #[test]
    fn rejects_truncated_string() {
        let err = decode(b"10:short").unwrap_err();
        assert_eq!(err.reason, DecodeReason::UnexpectedEnd);
    }

    #[test]
    fn rejects_garbage_integer() {
        let err = decode(b"ixyze").unwrap_err();
        assert_eq!(err.reason, DecodeReason::InvalidInteger);
    }

    #[test]
    fn rejects_unknown_lead_byte() {
        let err = decode(b"x").unwrap_err();
        assert_eq!(err.reason, DecodeReason::UnexpectedByte(b'x'));
    }

    #[test]
    fn json_conversion_keeps_structure() {
        let v = dict(vec![
            ("count", Value::from(3)),
            ("name", Value::from("bridge")),
        ]);
        let json = v.to_json();
        assert_eq!(json["count"], 3);
        assert_eq!(json["name"], "bridge");
    }

    // The engine only ever uses integers, byte strings, and lists/dicts of
    // those, so the round-trip property is checked over exactly that domain.
    fn value_strategy() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::Int),
            proptest::collection::vec(any::<u8>(), 0..24).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                proptest::collection::btree_map("[a-z-]{1,12}", inner, 0..6)
                    .prop_map(Value::Dict),
            ]
        })
    }

    proptest! {
        #[test]
        fn round_trips(v in value_strategy()) {
            let encoded = encode(&v);
            prop_assert_eq!(decode(&encoded).unwrap(), v);
        }
    }
}
