use hmccu_proto::latin1::latin1_to_utf8;
use hmccu_proto::Error;

pub use hmccu_proto::latin1::utf8_to_latin1;

/// Scans the first portion of an XML document for a declared
/// `encoding="..."` (or `'...'`) attribute in the prolog. The prolog is
/// always ASCII even when the body is not, so a byte-level scan is
/// safe regardless of the document's real encoding.
pub fn declared_encoding(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(256)];
    let needle = b"encoding=";
    let pos = head
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))?;
    let rest = &head[pos + needle.len()..];
    let quote = *rest.first()?;
    if quote != b'"' && quote != b'\'' {
        return None;
    }
    let end = rest[1..].iter().position(|&b| b == quote)?;
    Some(String::from_utf8_lossy(&rest[1..1 + end]).to_lowercase())
}

/// Decodes a received document's bytes to an internal UTF-8 `String`,
/// honoring the declared encoding but auto-detecting the case where
/// the Controller mislabels an already-UTF-8 document as Latin-1.
pub fn decode_document(bytes: &[u8]) -> Result<String, Error> {
    match declared_encoding(bytes) {
        Some(enc) if enc.contains("8859") || enc.contains("latin") => {
            match std::str::from_utf8(bytes) {
                Ok(s) => Ok(s.to_string()),
                Err(_) => Ok(latin1_to_utf8(bytes)),
            }
        }
        _ => std::str::from_utf8(bytes)
            .map(|s| s.to_string())
            .map_err(|e| Error::Malformed(format!("invalid utf-8: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_declared_encoding() {
        let doc = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><methodCall/>";
        assert_eq!(declared_encoding(doc).as_deref(), Some("iso-8859-1"));
    }

    #[test]
    fn mislabeled_utf8_is_detected() {
        let doc = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><methodName>caf\xc3\xa9</methodName>".to_vec();
        let s = decode_document(&doc).unwrap();
        assert!(s.contains('\u{e9}'));
    }
}
