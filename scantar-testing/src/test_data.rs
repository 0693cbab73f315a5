//! Deterministically-verifiable test data in an object store.

use crate::store::MemoryObjectStore;
use crate::Result;
use rand::prelude::*;
use sha2::Digest;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Spec for one test object to create in the source bucket.
#[derive(Clone, Debug)]
pub struct TestObject {
    pub key: String,
    pub size: usize,
}

impl TestObject {
    pub fn new(key: impl Into<String>, size: usize) -> Self {
        Self {
            key: key.into(),
            size,
        }
    }
}

/// The same spec plus the random data that was written and its hash.
#[derive(Clone, Debug)]
pub struct TestObjectWithData {
    pub key: String,
    pub data: Vec<u8>,
    pub hash: [u8; 32],
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Fill `bucket` with random-content objects, returning them keyed by object key for later
/// validation.
pub fn make_test_data(
    store: &MemoryObjectStore,
    bucket: &str,
    objects: impl IntoIterator<Item = TestObject>,
) -> HashMap<String, TestObjectWithData> {
    let mut rng = rand::thread_rng();
    let mut test_objects = HashMap::new();

    for object in objects {
        let mut data = vec![0u8; object.size];
        rng.fill(&mut data[..]);

        store.insert_object(bucket, &object.key, data.clone());

        let hash = sha256(&data);
        assert!(
            test_objects
                .insert(
                    object.key.clone(),
                    TestObjectWithData {
                        key: object.key.clone(),
                        data,
                        hash,
                    },
                )
                .is_none(),
            "BUG: test data contains the key '{}' more than once",
            object.key
        );
    }

    test_objects
}

/// Check that a directory an archive was extracted into contains exactly `expected_keys`, each
/// file byte-identical to the test object it was created from.
pub fn validate_extracted_dir(
    test_data: &HashMap<String, TestObjectWithData>,
    dir: &Path,
    expected_keys: &[&str],
) -> Result<()> {
    let mut remaining: HashSet<String> = expected_keys.iter().map(|k| k.to_string()).collect();

    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }

        let key = entry
            .path()
            .strip_prefix(dir)?
            .to_string_lossy()
            .into_owned();

        assert!(
            remaining.remove(&key),
            "archive contains '{key}' which was not expected here"
        );

        let expected = test_data
            .get(&key)
            .unwrap_or_else(|| panic!("BUG: no test data recorded for key '{key}'"));

        let data = std::fs::read(entry.path())?;
        assert_eq!(
            sha256(&data),
            expected.hash,
            "extracted file '{key}' does not match the source object"
        );
    }

    assert!(
        remaining.is_empty(),
        "expected keys missing from the archive: {}",
        remaining.into_iter().collect::<Vec<_>>().join(", ")
    );

    Ok(())
}
