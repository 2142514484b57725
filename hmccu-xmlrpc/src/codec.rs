use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use hmccu_proto::{Error, Fault, Value};

use crate::base64;
use crate::latin1::{decode_document, utf8_to_latin1};

fn tag_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn xml_err(e: quick_xml::Error) -> Error {
    Error::Malformed(e.to_string())
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------- encode

fn write_value(v: &Value, out: &mut String) {
    match v {
        Value::Empty => {}
        Value::Int(i) => out.push_str(&format!("<i4>{}</i4>", i)),
        Value::Bool(b) => out.push_str(&format!("<boolean>{}</boolean>", if *b { 1 } else { 0 })),
        Value::Double(d) => out.push_str(&format!("<double>{}</double>", d)),
        Value::String(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s));
            out.push_str("</string>");
        }
        Value::DateTime(s) => {
            out.push_str("<dateTime.iso8601>");
            out.push_str(&escape(s));
            out.push_str("</dateTime.iso8601>");
        }
        Value::Base64(bytes) => {
            out.push_str("<base64>");
            out.push_str(&base64::encode(bytes));
            out.push_str("</base64>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                out.push_str("<value>");
                write_value(item, out);
                out.push_str("</value>");
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (k, v) in members {
                out.push_str("<member><name>");
                out.push_str(&escape(k));
                out.push_str("</name><value>");
                write_value(v, out);
                out.push_str("</value></member>");
            }
            out.push_str("</struct>");
        }
    }
}

fn finish(body: String) -> Result<Vec<u8>, Error> {
    let doc = format!("<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>{}", body);
    utf8_to_latin1(&doc)
}

/// Encodes a method call. `params` is normally a [`Value::Array`];
/// each element becomes one `<param>`.
pub fn encode_call(method: &str, params: &Value) -> Result<Vec<u8>, Error> {
    let items: &[Value] = match params {
        Value::Array(v) => v.as_slice(),
        Value::Empty => &[],
        _ => return Err(Error::UnexpectedType),
    };

    let mut body = String::new();
    body.push_str("<methodCall><methodName>");
    body.push_str(&escape(method));
    body.push_str("</methodName><params>");
    for p in items {
        body.push_str("<param><value>");
        write_value(p, &mut body);
        body.push_str("</value></param>");
    }
    body.push_str("</params></methodCall>");

    finish(body)
}

/// Encodes a successful method response carrying a single result
/// value (which may be [`Value::Empty`] for void methods).
pub fn encode_response(result: &Value) -> Result<Vec<u8>, Error> {
    let mut body = String::new();
    body.push_str("<methodResponse><params><param><value>");
    write_value(result, &mut body);
    body.push_str("</value></param></params></methodResponse>");
    finish(body)
}

/// Encodes a method response carrying a fault.
pub fn encode_fault(fault: &Fault) -> Result<Vec<u8>, Error> {
    let members = Value::struct_from(vec![
        ("faultCode".to_string(), Value::Int(fault.code)),
        (
            "faultString".to_string(),
            Value::String(fault.message.clone()),
        ),
    ]);

    let mut body = String::new();
    body.push_str("<methodResponse><fault><value>");
    write_value(&members, &mut body);
    body.push_str("</value></fault></methodResponse>");
    finish(body)
}

// ---------------------------------------------------------------- decode

type XReader<'a> = Reader<&'a [u8]>;

fn next_event<'a>(reader: &mut XReader<'a>) -> Result<Event<'a>, Error> {
    reader.read_event().map_err(xml_err)
}

/// Reads character data up to (and consuming) the matching end tag
/// `tag`. Used for leaf elements whose content is plain text.
fn read_text_until_end(reader: &mut XReader<'_>, tag: &str) -> Result<String, Error> {
    let mut s = String::new();
    loop {
        match next_event(reader)? {
            Event::Text(t) => {
                s.push_str(&t.unescape().map_err(xml_err)?.into_owned());
            }
            Event::CData(t) => {
                s.push_str(&String::from_utf8_lossy(&t.into_inner()));
            }
            Event::End(e) if tag_name(&e) == tag => break,
            Event::Eof => return Err(Error::Malformed(format!("unterminated <{}>", tag))),
            _ => return Err(Error::Malformed(format!("unexpected content in <{}>", tag))),
        }
    }
    Ok(s)
}

/// Parses the contents of a typed tag whose opening `Start` event has
/// already been consumed, through its matching closing tag.
fn parse_typed(reader: &mut XReader<'_>, tag: &str) -> Result<Value, Error> {
    match tag {
        "int" | "i4" => {
            let s = read_text_until_end(reader, tag)?;
            s.trim()
                .parse::<i32>()
                .map(Value::Int)
                .map_err(|_| Error::Malformed(format!("bad integer: {}", s)))
        }
        "boolean" => {
            let s = read_text_until_end(reader, tag)?;
            match s.trim() {
                "0" => Ok(Value::Bool(false)),
                "1" => Ok(Value::Bool(true)),
                other => Err(Error::Malformed(format!("bad boolean literal: {}", other))),
            }
        }
        "double" => {
            let s = read_text_until_end(reader, tag)?;
            s.trim()
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|_| Error::Malformed(format!("bad double: {}", s)))
        }
        "string" => read_text_until_end(reader, tag).map(Value::String),
        "dateTime.iso8601" => read_text_until_end(reader, tag).map(Value::DateTime),
        "base64" => {
            let s = read_text_until_end(reader, tag)?;
            base64::decode(&s)
                .map(Value::Base64)
                .ok_or_else(|| Error::Malformed("bad base64 payload".into()))
        }
        "array" => parse_array_body(reader),
        "struct" => parse_struct_body(reader),
        _ => Err(Error::UnexpectedType),
    }
}

/// Parses the body of a `<value>` whose opening tag has already been
/// consumed (it may have been a `Start` or the contents may begin
/// directly with text or the matching `End`).
fn parse_value_body(reader: &mut XReader<'_>) -> Result<Value, Error> {
    match next_event(reader)? {
        Event::End(e) if tag_name(&e) == "value" => Ok(Value::Empty),
        Event::Text(t) => {
            let mut s = t.unescape().map_err(xml_err)?.into_owned();
            loop {
                match next_event(reader)? {
                    Event::Text(t2) => s.push_str(&t2.unescape().map_err(xml_err)?.into_owned()),
                    Event::End(e) if tag_name(&e) == "value" => break,
                    Event::Eof => return Err(Error::Malformed("unterminated <value>".into())),
                    _ => return Err(Error::Malformed("unexpected content in <value>".into())),
                }
            }
            Ok(Value::String(s))
        }
        Event::Start(e) => {
            let tag = tag_name(&e);
            let v = parse_typed(reader, &tag)?;
            match next_event(reader)? {
                Event::End(end) if tag_name(&end) == "value" => Ok(v),
                _ => Err(Error::Malformed("expected </value>".into())),
            }
        }
        Event::Empty(e) => {
            let tag = tag_name(&e);
            let v = match tag.as_str() {
                "string" => Value::String(String::new()),
                "array" => Value::Array(vec![]),
                "struct" => Value::Struct(vec![]),
                "int" | "i4" => Value::Int(0),
                "boolean" => Value::Bool(false),
                "double" => Value::Double(0.0),
                "base64" => Value::Base64(vec![]),
                "dateTime.iso8601" => Value::DateTime(String::new()),
                _ => return Err(Error::UnexpectedType),
            };
            match next_event(reader)? {
                Event::End(end) if tag_name(&end) == "value" => Ok(v),
                _ => Err(Error::Malformed("expected </value>".into())),
            }
        }
        Event::Eof => Err(Error::Malformed("unterminated <value>".into())),
        _ => Err(Error::Malformed("unexpected content in <value>".into())),
    }
}

/// Reads one `<value>...</value>` (or self-closed `<value/>`) element,
/// consuming its opening tag itself (unlike `parse_value_body`).
fn read_one_value(reader: &mut XReader<'_>) -> Result<Value, Error> {
    loop {
        match next_event(reader)? {
            Event::Start(e) if tag_name(&e) == "value" => return parse_value_body(reader),
            Event::Empty(e) if tag_name(&e) == "value" => return Ok(Value::Empty),
            Event::Text(_) | Event::Comment(_) => continue,
            Event::Eof => return Err(Error::Malformed("expected <value>".into())),
            _ => return Err(Error::Malformed("expected <value>".into())),
        }
    }
}

fn parse_array_body(reader: &mut XReader<'_>) -> Result<Value, Error> {
    // Expect <data>
    loop {
        match next_event(reader)? {
            Event::Start(e) if tag_name(&e) == "data" => break,
            Event::Empty(e) if tag_name(&e) == "data" => {
                // Empty data with no values; still need closing </array>.
                expect_end(reader, "array")?;
                return Ok(Value::Array(vec![]));
            }
            Event::Eof => return Err(Error::Malformed("expected <data>".into())),
            _ => return Err(Error::Malformed("expected <data>".into())),
        }
    }

    let mut items = Vec::new();
    loop {
        match next_event(reader)? {
            Event::Start(e) if tag_name(&e) == "value" => items.push(parse_value_body(reader)?),
            Event::Empty(e) if tag_name(&e) == "value" => items.push(Value::Empty),
            Event::End(e) if tag_name(&e) == "data" => break,
            Event::Eof => return Err(Error::Malformed("unterminated <data>".into())),
            _ => return Err(Error::Malformed("unexpected content in <data>".into())),
        }
    }
    expect_end(reader, "array")?;
    Ok(Value::Array(items))
}

fn parse_struct_body(reader: &mut XReader<'_>) -> Result<Value, Error> {
    let mut members = Vec::new();
    loop {
        match next_event(reader)? {
            Event::Start(e) if tag_name(&e) == "member" => {
                let name = loop {
                    match next_event(reader)? {
                        Event::Start(e) if tag_name(&e) == "name" => {
                            break read_text_until_end(reader, "name")?
                        }
                        Event::Eof => return Err(Error::Malformed("expected <name>".into())),
                        _ => return Err(Error::Malformed("expected <name>".into())),
                    }
                };
                let value = read_one_value(reader)?;
                expect_end(reader, "member")?;
                members.push((name, value));
            }
            Event::End(e) if tag_name(&e) == "struct" => break,
            Event::Eof => return Err(Error::Malformed("unterminated <struct>".into())),
            _ => return Err(Error::Malformed("unexpected content in <struct>".into())),
        }
    }
    Ok(Value::Struct(members))
}

fn expect_end(reader: &mut XReader<'_>, tag: &str) -> Result<(), Error> {
    match next_event(reader)? {
        Event::End(e) if tag_name(&e) == tag => Ok(()),
        Event::Eof => Err(Error::Malformed(format!("expected </{}>", tag))),
        _ => Err(Error::Malformed(format!("expected </{}>", tag))),
    }
}

/// Decodes a `<methodCall>` document, returning the method name and
/// its parameters re-wrapped as a single [`Value::Array`].
pub fn decode_call(bytes: &[u8]) -> Result<(String, Value), Error> {
    let text = decode_document(bytes)?;
    let mut reader = Reader::from_str(&text);
    reader.config_mut().trim_text(true);

    let mut method_name: Option<String> = None;
    let mut params = Vec::new();

    loop {
        match next_event(&mut reader)? {
            Event::Start(e) if tag_name(&e) == "methodName" => {
                method_name = Some(read_text_until_end(&mut reader, "methodName")?);
            }
            Event::Start(e) if tag_name(&e) == "param" => {
                let v = read_one_value(&mut reader)?;
                expect_end(&mut reader, "param")?;
                params.push(v);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let name = method_name.ok_or_else(|| Error::Malformed("missing methodName".into()))?;
    Ok((name, Value::Array(params)))
}

/// Decodes a `<methodResponse>` document into either the result value
/// or the fault it carried.
pub fn decode_response(bytes: &[u8]) -> Result<Result<Value, Fault>, Error> {
    let text = decode_document(bytes)?;
    let mut reader = Reader::from_str(&text);
    reader.config_mut().trim_text(true);

    loop {
        match next_event(&mut reader)? {
            Event::Start(e) if tag_name(&e) == "param" => {
                let v = read_one_value(&mut reader)?;
                expect_end(&mut reader, "param")?;
                return Ok(Ok(v));
            }
            Event::Start(e) if tag_name(&e) == "fault" => {
                let v = read_one_value(&mut reader)?;
                expect_end(&mut reader, "fault")?;
                let code = v.member("faultCode").and_then(Value::as_int).ok_or_else(|| {
                    Error::Malformed("fault missing faultCode".into())
                })?;
                let message = v
                    .member("faultString")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Malformed("fault missing faultString".into()))?
                    .to_string();
                return Ok(Err(Fault::new(code, message)));
            }
            Event::Eof => return Err(Error::Malformed("missing <params> or <fault>".into())),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_call_with_no_params() {
        let bytes = encode_call("system.listMethods", &Value::Array(vec![])).unwrap();

        assert_eq!(
            bytes,
            b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><methodCall><methodName>system.listMethods</methodName><params></params></methodCall>"
        );

        let (name, params) = decode_call(&bytes).unwrap();
        assert_eq!(name, "system.listMethods");
        assert_eq!(params, Value::Array(vec![]));
    }

    #[test]
    fn round_trips_mixed_scalar_params() {
        let params = Value::Array(vec![
            Value::String("Hello world!".into()),
            Value::Int(123),
            Value::Bool(true),
            Value::Double(3.5),
        ]);
        let bytes = encode_call("echo", &params).unwrap();
        let (name, decoded) = decode_call(&bytes).unwrap();

        assert_eq!(name, "echo");
        assert_eq!(decoded, params);
    }

    #[test]
    fn accepts_int_and_i4_interchangeably() {
        let doc = b"<?xml version=\"1.0\"?><methodCall><methodName>m</methodName><params><param><value><int>5</int></value></param><param><value><i4>6</i4></value></param></params></methodCall>";
        let (_, params) = decode_call(doc).unwrap();

        assert_eq!(
            params,
            Value::Array(vec![Value::Int(5), Value::Int(6)])
        );
    }

    #[test]
    fn rejects_non_literal_boolean() {
        let doc = b"<?xml version=\"1.0\"?><methodCall><methodName>m</methodName><params><param><value><boolean>true</boolean></value></param></params></methodCall>";
        assert!(decode_call(doc).is_err());
    }

    #[test]
    fn empty_response_value_has_no_inner_tag() {
        let bytes = encode_response(&Value::Empty).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();

        assert!(text.contains("<value></value>"));

        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded, Ok(Value::Empty));
    }

    #[test]
    fn fault_round_trips_code_and_message() {
        let fault = Fault::new(-1, "boom");
        let bytes = encode_fault(&fault).unwrap();
        let decoded = decode_response(&bytes).unwrap();

        assert_eq!(decoded, Err(fault));
    }

    #[test]
    fn struct_and_array_round_trip() {
        let v = Value::struct_from(vec![
            ("NAME".to_string(), Value::String("SW1".into())),
            (
                "LIST".to_string(),
                Value::Array(vec![Value::Int(1), Value::Int(2)]),
            ),
        ]);
        let bytes = encode_response(&v).unwrap();
        let decoded = decode_response(&bytes).unwrap().unwrap();

        assert_eq!(decoded, v);
    }
}
