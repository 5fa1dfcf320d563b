//! Thin wrapper over the `bloomfilter` crate sized for a target
//! false-positive rate. No false negatives by construction.

use bloomfilter::Bloom;

pub struct BloomFilter {
    inner: Bloom<[u8]>,
}

impl BloomFilter {
    pub fn build<'a>(keys: impl ExactSizeIterator<Item = &'a [u8]>, fp_rate: f64) -> Self {
        let count = keys.len().max(1);
        let mut bloom = Bloom::<[u8]>::new_for_fp_rate(count, fp_rate)
            .unwrap_or_else(|_| Bloom::<[u8]>::new_for_fp_rate(count.max(16), 0.1).unwrap());
        for key in keys {
            bloom.set(key);
        }
        Self { inner: bloom }
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.inner.check(key)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.clone().into_bytes()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        Bloom::<[u8]>::from_bytes(bytes).ok().map(|inner| Self { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..500).map(|i| format!("key-{i}").into_bytes()).collect();
        let filter = BloomFilter::build(keys.iter().map(|k| k.as_slice()), 0.01);
        for key in &keys {
            assert!(filter.may_contain(key));
        }
    }

    #[test]
    fn roundtrips_through_bytes() {
        let keys: Vec<Vec<u8>> = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let filter = BloomFilter::build(keys.iter().map(|k| k.as_slice()), 0.01);
        let bytes = filter.to_bytes();
        let restored = BloomFilter::from_bytes(bytes).unwrap();
        for key in &keys {
            assert!(restored.may_contain(key));
        }
    }
}
