use hmccu_proto::latin1::{latin1_to_utf8, utf8_to_latin1};
use hmccu_proto::{Error, Fault, Value};

use crate::double;

const TAG_INT: u32 = 0x001;
const TAG_BOOL: u32 = 0x002;
const TAG_STRING: u32 = 0x003;
const TAG_DOUBLE: u32 = 0x004;
const TAG_ARRAY: u32 = 0x100;
const TAG_STRUCT: u32 = 0x101;

// Extension tags for the preserved-but-uninterpreted value kinds. The
// wire format in spec only enumerates the six tags above; these two
// keep date/time and opaque-byte values round-tripping over the
// binary dialect the same way the XML dialect preserves them.
const TAG_DATETIME: u32 = 0x005;
const TAG_BASE64: u32 = 0x006;

const MAGIC: &[u8; 3] = b"Bin";
const MSG_REQUEST: u8 = 0x00;
const MSG_RESPONSE: u8 = 0x01;
const MSG_FAULT: u8 = 0xFF;

/// A fully decoded BIN-RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request { method: String, params: Value },
    Response(Value),
    Fault(Fault),
}

fn frame(msg_type: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(MAGIC);
    out.push(msg_type);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

fn encode_value(v: &Value, out: &mut Vec<u8>) -> Result<(), Error> {
    match v {
        Value::Empty => {
            out.extend_from_slice(&TAG_STRING.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
        }
        Value::Int(i) => {
            out.extend_from_slice(&TAG_INT.to_be_bytes());
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Bool(b) => {
            out.extend_from_slice(&TAG_BOOL.to_be_bytes());
            out.push(if *b { 1 } else { 0 });
        }
        Value::String(s) => {
            out.extend_from_slice(&TAG_STRING.to_be_bytes());
            let bytes = utf8_to_latin1(s)?;
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(&bytes);
        }
        Value::Double(d) => {
            out.extend_from_slice(&TAG_DOUBLE.to_be_bytes());
            let (man, exp) = double::encode(*d);
            out.extend_from_slice(&man.to_be_bytes());
            out.extend_from_slice(&exp.to_be_bytes());
        }
        Value::Array(items) => {
            out.extend_from_slice(&TAG_ARRAY.to_be_bytes());
            out.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode_value(item, out)?;
            }
        }
        Value::Struct(members) => {
            out.extend_from_slice(&TAG_STRUCT.to_be_bytes());
            out.extend_from_slice(&(members.len() as u32).to_be_bytes());
            for (k, v) in members {
                let kb = utf8_to_latin1(k)?;
                out.extend_from_slice(&(kb.len() as u32).to_be_bytes());
                out.extend_from_slice(&kb);
                encode_value(v, out)?;
            }
        }
        Value::DateTime(s) => {
            out.extend_from_slice(&TAG_DATETIME.to_be_bytes());
            let bytes = utf8_to_latin1(s)?;
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(&bytes);
        }
        Value::Base64(b) => {
            out.extend_from_slice(&TAG_BASE64.to_be_bytes());
            out.extend_from_slice(&(b.len() as u32).to_be_bytes());
            out.extend_from_slice(b);
        }
    }
    Ok(())
}

/// Encodes a request frame. `params` is normally a [`Value::Array`].
pub fn encode_request(method: &str, params: &Value) -> Result<Vec<u8>, Error> {
    let items: &[Value] = match params {
        Value::Array(v) => v.as_slice(),
        Value::Empty => &[],
        _ => return Err(Error::UnexpectedType),
    };

    let name_bytes = utf8_to_latin1(method)?;
    let mut payload = Vec::new();
    payload.extend_from_slice(&(name_bytes.len() as u32).to_be_bytes());
    payload.extend_from_slice(&name_bytes);
    payload.extend_from_slice(&(items.len() as u32).to_be_bytes());
    for item in items {
        encode_value(item, &mut payload)?;
    }

    Ok(frame(MSG_REQUEST, payload))
}

pub fn encode_response(result: &Value) -> Result<Vec<u8>, Error> {
    let mut payload = Vec::new();
    encode_value(result, &mut payload)?;
    Ok(frame(MSG_RESPONSE, payload))
}

pub fn encode_fault(fault: &Fault) -> Result<Vec<u8>, Error> {
    let v = Value::struct_from(vec![
        ("faultCode".to_string(), Value::Int(fault.code)),
        (
            "faultString".to_string(),
            Value::String(fault.message.clone()),
        ),
    ]);
    let mut payload = Vec::new();
    encode_value(&v, &mut payload)?;
    Ok(frame(MSG_FAULT, payload))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Malformed("truncated message".into()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes(b.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, Error> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes(b.try_into().unwrap()))
    }
}

fn decode_value(c: &mut Cursor<'_>) -> Result<Value, Error> {
    let tag = c.u32()?;
    match tag {
        TAG_INT => Ok(Value::Int(c.i32()?)),
        TAG_BOOL => match c.u8()? {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            other => Err(Error::Malformed(format!("bad boolean byte: {}", other))),
        },
        TAG_STRING => {
            let n = c.u32()? as usize;
            let bytes = c.take(n)?;
            // A zero-length string is the wire encoding of an empty
            // Value (data model invariant iv); round-trip it back.
            if n == 0 {
                Ok(Value::Empty)
            } else {
                Ok(Value::String(latin1_to_utf8(bytes)))
            }
        }
        TAG_DOUBLE => {
            let man = c.i32()?;
            let exp = c.i32()?;
            Ok(Value::Double(double::decode(man, exp)))
        }
        TAG_ARRAY => {
            let n = c.u32()? as usize;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(decode_value(c)?);
            }
            Ok(Value::Array(items))
        }
        TAG_STRUCT => {
            let n = c.u32()? as usize;
            let mut members = Vec::with_capacity(n);
            for _ in 0..n {
                let klen = c.u32()? as usize;
                let key = latin1_to_utf8(c.take(klen)?);
                let value = decode_value(c)?;
                members.push((key, value));
            }
            Ok(Value::Struct(members))
        }
        TAG_DATETIME => {
            let n = c.u32()? as usize;
            Ok(Value::DateTime(latin1_to_utf8(c.take(n)?)))
        }
        TAG_BASE64 => {
            let n = c.u32()? as usize;
            Ok(Value::Base64(c.take(n)?.to_vec()))
        }
        other => Err(Error::Malformed(format!("unknown value tag: {:#x}", other))),
    }
}

fn decode_request_payload(payload: &[u8]) -> Result<(String, Value), Error> {
    let mut c = Cursor::new(payload);
    let name_len = c.u32()? as usize;
    let name = latin1_to_utf8(c.take(name_len)?);
    let param_count = c.u32()? as usize;
    let mut params = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        params.push(decode_value(&mut c)?);
    }
    Ok((name, Value::Array(params)))
}

fn fault_from_value(v: &Value) -> Result<Fault, Error> {
    let code = v
        .member("faultCode")
        .and_then(Value::as_int)
        .ok_or_else(|| Error::Malformed("fault missing faultCode".into()))?;
    let message = v
        .member("faultString")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Malformed("fault missing faultString".into()))?
        .to_string();
    Ok(Fault::new(code, message))
}

/// Decodes one full framed message (header + payload), enforcing
/// `max_size` against the declared payload length before reading it.
pub fn decode_message(bytes: &[u8], max_size: usize) -> Result<Message, Error> {
    if bytes.len() < crate::HEADER_LEN {
        return Err(Error::Malformed("frame shorter than header".into()));
    }
    if &bytes[0..3] != MAGIC {
        return Err(Error::Malformed("bad magic".into()));
    }
    let msg_type = bytes[3];
    let len = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
    if len > max_size {
        return Err(Error::OverSize);
    }
    if bytes.len() < crate::HEADER_LEN + len {
        return Err(Error::Malformed("truncated payload".into()));
    }
    let payload = &bytes[crate::HEADER_LEN..crate::HEADER_LEN + len];

    match msg_type {
        MSG_REQUEST => {
            let (method, params) = decode_request_payload(payload)?;
            Ok(Message::Request { method, params })
        }
        MSG_RESPONSE => {
            let mut c = Cursor::new(payload);
            Ok(Message::Response(decode_value(&mut c)?))
        }
        MSG_FAULT => {
            let mut c = Cursor::new(payload);
            let v = decode_value(&mut c)?;
            Ok(Message::Fault(fault_from_value(&v)?))
        }
        other => Err(Error::Malformed(format!("unknown message type: {:#x}", other))),
    }
}
