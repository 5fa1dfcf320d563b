//! Encodes/decodes documents to the standard self-describing binary codec:
//! MessagePack via `rmp-serde`. Self-describing, no schema registry, and a
//! direct `serde` mapping for every document value kind.

use crate::document::value::Document;
use crate::error::Result;

pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(doc)?)
}

pub fn decode_document(bytes: &[u8]) -> Result<Document> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::value::Value;

    #[test]
    fn round_trips_every_value_kind() {
        let mut doc = Document::new();
        doc.set("n", Value::Null);
        doc.set("b", Value::Bool(true));
        doc.set("i", Value::Int(-42));
        doc.set("f", Value::Float(1.5));
        doc.set("s", Value::String("hi".to_string()));
        doc.set("by", Value::Bytes(vec![1, 2, 3]));
        doc.set("a", Value::Array(vec![Value::Int(1), Value::Int(2)]));
        let mut nested = Document::new();
        nested.set("x", Value::Int(7));
        doc.set("d", Value::Document(nested));

        let bytes = encode_document(&doc).unwrap();
        let decoded = decode_document(&bytes).unwrap();
        assert_eq!(doc, decoded);
    }

    #[test]
    fn decode_of_encode_is_byte_identical_on_second_pass() {
        let mut doc = Document::new();
        doc.set("name", Value::String("Alice".to_string()));
        doc.set("age", Value::Int(28));
        let bytes = encode_document(&doc).unwrap();
        let decoded = decode_document(&bytes).unwrap();
        let bytes2 = encode_document(&decoded).unwrap();
        assert_eq!(bytes, bytes2);
    }
}
