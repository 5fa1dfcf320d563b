//! Key-layout convention, centralized here so every layer
//! that needs to build or scan a key goes through the same encoding.
//!
//! Secondary-index keys embed the field's collated sort-key bytes
//! (`Value::encode_sort_key`) between the field name and the doc id.
//! Because the doc id is always exactly 16 ASCII hex bytes, it can be
//! recovered by stripping the last 16 bytes of the key rather than by a
//! delimiter, so the encoded value is free to contain arbitrary bytes.

pub const DOC_ID_LEN: usize = 16;

pub fn doc_key(db: &str, collection: &str, doc_id: &str) -> Vec<u8> {
    format!("db:{db}:col:{collection}:doc:{doc_id}").into_bytes()
}

pub fn doc_prefix(db: &str, collection: &str) -> Vec<u8> {
    format!("db:{db}:col:{collection}:doc:").into_bytes()
}

pub fn idx_prefix(db: &str, collection: &str, field: &str) -> Vec<u8> {
    format!("db:{db}:col:{collection}:idx:{field}:").into_bytes()
}

pub fn idx_key(db: &str, collection: &str, field: &str, encoded_value: &[u8], doc_id: &str) -> Vec<u8> {
    let mut key = idx_prefix(db, collection, field);
    key.extend_from_slice(encoded_value);
    key.extend_from_slice(doc_id.as_bytes());
    key
}

/// Recovers the doc id suffix from an index-entry key (see module docs).
pub fn idx_key_doc_id(key: &[u8]) -> Option<&str> {
    if key.len() < DOC_ID_LEN {
        return None;
    }
    std::str::from_utf8(&key[key.len() - DOC_ID_LEN..]).ok()
}

pub fn vec_key(db: &str, collection: &str, doc_id: &str) -> Vec<u8> {
    format!("db:{db}:col:{collection}:vec:{doc_id}").into_bytes()
}

pub fn vec_prefix(db: &str, collection: &str) -> Vec<u8> {
    format!("db:{db}:col:{collection}:vec:").into_bytes()
}

pub fn collection_prefix(db: &str, collection: &str) -> Vec<u8> {
    format!("db:{db}:col:{collection}:").into_bytes()
}

pub fn meta_db_key(db: &str) -> Vec<u8> {
    format!("meta:db:{db}").into_bytes()
}

pub fn meta_db_prefix() -> Vec<u8> {
    b"meta:db:".to_vec()
}

pub fn meta_user_key(username: &str) -> Vec<u8> {
    format!("meta:user:{username}").into_bytes()
}

pub fn meta_user_prefix() -> Vec<u8> {
    b"meta:user:".to_vec()
}

/// Secondary lookup from API key to username, so authentication by key
/// doesn't require scanning every user record.
pub fn meta_apikey_key(api_key: &str) -> Vec<u8> {
    format!("meta:apikey:{api_key}").into_bytes()
}

pub fn is_valid_database_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub fn is_valid_collection_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idx_key_doc_id_roundtrip() {
        let key = idx_key("default", "users", "age", &[0x02, 0x80], "0123456789abcdef");
        assert_eq!(idx_key_doc_id(&key), Some("0123456789abcdef"));
    }

    #[test]
    fn prefixes_sort_before_their_entries() {
        let prefix = doc_prefix("default", "users");
        let key = doc_key("default", "users", "0123456789abcdef");
        assert!(key.starts_with(&prefix));
    }

    #[test]
    fn validates_database_and_collection_names() {
        assert!(is_valid_database_name("default"));
        assert!(is_valid_database_name("my_db_1"));
        assert!(!is_valid_database_name("My_DB"));
        assert!(!is_valid_database_name(""));
        assert!(is_valid_collection_name("Users_1"));
        assert!(!is_valid_collection_name("users-1"));
    }
}
