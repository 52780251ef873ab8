//! Remote references: local placeholders for tensors owned elsewhere.
//!
//! A [`RemoteRef`] never performs I/O. It is a passive data sink whose
//! cache is overwritten only through [`RemoteRef::update`], and only
//! when the incoming version is strictly greater than the stored one.
//! Version 0 means "never populated".

use crate::data::TensorData;
use crate::dtype::DType;
use crate::error::GraphError;
use crate::shape::Shape;

/// A placeholder leaf standing in for a tensor computed on another peer.
#[derive(Debug, Clone)]
pub struct RemoteRef {
    cluster_id: String,
    node_uid: String,
    dtype: DType,
    shape: Shape,
    cache: TensorData,
    version: u64,
}

impl RemoteRef {
    /// Create an unpopulated reference (zeroed cache, version 0).
    #[must_use]
    pub fn new(cluster_id: String, node_uid: String, dtype: DType, shape: Shape) -> Self {
        let cache = TensorData::zeroed(dtype, &shape);
        Self {
            cluster_id,
            node_uid,
            dtype,
            shape,
            cache,
            version: 0,
        }
    }

    /// Apply an inbound value under the monotonic freshness rule.
    ///
    /// The cache is replaced only when `version` is strictly greater
    /// than the stored version; out-of-order and duplicate responses
    /// are silently dropped. `values` is the wire-format f64 payload
    /// and is narrowed to the declared dtype. Returns whether the
    /// cache was updated.
    ///
    /// # Errors
    ///
    /// A payload whose length disagrees with the declared shape is a
    /// protocol error: the cache and version stay untouched and the
    /// mismatch is reported as [`GraphError::BufferSize`]. A malformed
    /// value must never be stamped fresh.
    pub fn update(&mut self, values: &[f64], version: u64) -> Result<bool, GraphError> {
        let n = self.shape.n_elems();
        if values.len() != n {
            return Err(GraphError::BufferSize {
                got: values.len() * self.dtype.size_bytes(),
                expected: n * self.dtype.size_bytes(),
            });
        }
        if version <= self.version {
            return Ok(false);
        }
        self.cache = TensorData::from_f64s(self.dtype, values);
        self.version = version;
        Ok(true)
    }

    /// Current cached value and version (version 0 = never populated).
    #[must_use]
    pub fn read(&self) -> (&TensorData, u64) {
        (&self.cache, self.version)
    }

    /// Whether the reference has received at least one value.
    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.version > 0
    }

    /// Id of the cluster that owns the underlying tensor.
    #[must_use]
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// The tensor's globally shared node id.
    #[must_use]
    pub fn node_uid(&self) -> &str {
        &self.node_uid
    }

    /// Declared element dtype.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Declared shape.
    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_ref() -> RemoteRef {
        RemoteRef::new(
            "peer-a".into(),
            "uid-1".into(),
            DType::F64,
            Shape::new(vec![3]).unwrap(),
        )
    }

    #[test]
    fn test_starts_unpopulated() {
        let r = test_ref();
        assert!(!r.is_populated());
        assert_eq!(r.read().1, 0);
        assert_eq!(r.read().0.n_elems(), 3);
    }

    #[test]
    fn test_update_applies_newer() {
        let mut r = test_ref();
        assert!(r.update(&[1.0, 2.0, 3.0], 1).unwrap());
        assert_eq!(r.read().0.to_f64s(), vec![1.0, 2.0, 3.0]);
        assert_eq!(r.read().1, 1);
    }

    #[test]
    fn test_update_drops_stale_and_duplicate() {
        let mut r = test_ref();
        assert!(r.update(&[1.0, 1.0, 1.0], 5).unwrap());
        assert!(!r.update(&[9.0, 9.0, 9.0], 5).unwrap());
        assert!(!r.update(&[9.0, 9.0, 9.0], 2).unwrap());
        assert_eq!(r.read().0.to_f64s(), vec![1.0, 1.0, 1.0]);
        assert_eq!(r.read().1, 5);
    }

    #[test]
    fn test_update_narrows_dtype() {
        let mut r = RemoteRef::new(
            "peer-a".into(),
            "uid-2".into(),
            DType::I32,
            Shape::new(vec![2]).unwrap(),
        );
        r.update(&[1.7, -2.4], 1).unwrap();
        assert_eq!(r.read().0.to_f64s(), vec![1.0, -2.0]);
    }

    #[test]
    fn test_update_rejects_wrong_length_payload() {
        let mut r = test_ref();
        let err = r.update(&[42.0], 9);
        assert!(matches!(err, Err(GraphError::BufferSize { .. })));
        // the malformed value must not look fresh
        assert!(!r.is_populated());
        assert_eq!(r.read().1, 0);
        assert_eq!(r.read().0.to_f64s(), vec![0.0, 0.0, 0.0]);
        // a later well-formed value is unaffected
        assert!(r.update(&[1.0, 2.0, 3.0], 1).unwrap());
    }

    proptest! {
        // Across any update sequence the stored version never
        // decreases and the cache tracks the highest version applied.
        #[test]
        fn prop_monotonic_cache(updates in prop::collection::vec(
            (prop::collection::vec(-1e6f64..1e6, 3), 0u64..20), 0..32))
        {
            let mut r = test_ref();
            let mut highest = 0u64;
            let mut expect: Option<Vec<f64>> = None;
            let mut last_version = 0u64;
            for (values, version) in updates {
                r.update(&values, version).unwrap();
                prop_assert!(r.read().1 >= last_version);
                last_version = r.read().1;
                if version > highest {
                    highest = version;
                    expect = Some(values);
                }
            }
            prop_assert_eq!(r.read().1, highest);
            if let Some(expect) = expect {
                prop_assert_eq!(r.read().0.to_f64s(), expect);
            }
        }
    }
}
