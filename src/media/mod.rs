/// Object-storage port. The core only ever stores opaque keys; turning a key
/// into something a client can load is delegated here.
pub trait ObjectStore: Send + Sync {
    fn to_display_url(&self, key: &str) -> String;

    fn to_display_urls(&self, keys: &[String]) -> Vec<String> {
        keys.iter().map(|key| self.to_display_url(key)).collect()
    }
}

/// Dev implementation: prefixes keys with a configured base URL. Signed-URL
/// generation lives in the real storage service.
pub struct PrefixedUrlStore {
    base_url: String,
}

impl PrefixedUrlStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl ObjectStore for PrefixedUrlStore {
    fn to_display_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_keys_with_base_url() {
        let store = PrefixedUrlStore::new("https://media.example.com/");
        assert_eq!(
            store.to_display_url("proofs/abc.jpg"),
            "https://media.example.com/proofs/abc.jpg"
        );
    }

    #[test]
    fn maps_key_lists() {
        let store = PrefixedUrlStore::new("https://media.example.com");
        let keys = vec!["a.jpg".to_string(), "b.jpg".to_string()];
        assert_eq!(
            store.to_display_urls(&keys),
            vec![
                "https://media.example.com/a.jpg",
                "https://media.example.com/b.jpg"
            ]
        );
    }
}
