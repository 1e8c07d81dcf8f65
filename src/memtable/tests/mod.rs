use crate::internal_key::ValueType;
use crate::memtable::{Memtable, MemtableLookup};

#[test]
fn put_then_get_returns_latest_value() {
    let mt = Memtable::new();
    mt.insert(b"a", 1, ValueType::Value, b"v1").unwrap();
    mt.insert(b"a", 2, ValueType::Value, b"v2").unwrap();
    assert_eq!(
        mt.get(b"a", 10).unwrap(),
        MemtableLookup::Value(b"v2".to_vec())
    );
}

#[test]
fn tombstone_hides_prior_value() {
    let mt = Memtable::new();
    mt.insert(b"a", 1, ValueType::Value, b"v1").unwrap();
    mt.insert(b"a", 2, ValueType::Tombstone, b"").unwrap();
    assert_eq!(mt.get(b"a", 10).unwrap(), MemtableLookup::Tombstone);
}

#[test]
fn read_seq_bounds_visibility() {
    let mt = Memtable::new();
    mt.insert(b"a", 1, ValueType::Value, b"v1").unwrap();
    mt.insert(b"a", 5, ValueType::Tombstone, b"").unwrap();
    assert_eq!(
        mt.get(b"a", 3).unwrap(),
        MemtableLookup::Value(b"v1".to_vec()),
        "snapshot at seq=3 must not see the later tombstone"
    );
    assert_eq!(mt.get(b"a", 5).unwrap(), MemtableLookup::Tombstone);
}

#[test]
fn missing_key_returns_not_found() {
    let mt = Memtable::new();
    mt.insert(b"a", 1, ValueType::Value, b"v1").unwrap();
    assert_eq!(mt.get(b"z", 10).unwrap(), MemtableLookup::NotFound);
}

#[test]
fn snapshot_iterates_in_internal_key_order() {
    let mt = Memtable::new();
    mt.insert(b"b", 1, ValueType::Value, b"b1").unwrap();
    mt.insert(b"a", 2, ValueType::Value, b"a2").unwrap();
    mt.insert(b"a", 1, ValueType::Value, b"a1").unwrap();

    let mut it = mt.snapshot();
    it.seek_to_first();
    let mut seen = Vec::new();
    while it.valid() {
        let (uk, seq, _) = crate::internal_key::decode(&it.key().unwrap().0).unwrap();
        seen.push((uk.to_vec(), seq));
        it.next();
    }
    assert_eq!(
        seen,
        vec![(b"a".to_vec(), 2), (b"a".to_vec(), 1), (b"b".to_vec(), 1)]
    );
}

#[test]
fn approximate_size_grows_with_inserts() {
    let mt = Memtable::new();
    assert_eq!(mt.approximate_size(), 0);
    mt.insert(b"key", 1, ValueType::Value, b"value").unwrap();
    assert!(mt.approximate_size() > 0);
}

#[test]
fn seek_positions_at_first_key_greater_or_equal() {
    let mt = Memtable::new();
    mt.insert(b"a", 1, ValueType::Value, b"1").unwrap();
    mt.insert(b"c", 1, ValueType::Value, b"3").unwrap();
    let mut it = mt.snapshot();
    let target = crate::internal_key::InternalKey::new(b"b", 1, ValueType::Value).unwrap();
    it.seek(&target);
    assert!(it.valid());
    let (uk, _, _) = crate::internal_key::decode(&it.key().unwrap().0).unwrap();
    assert_eq!(uk, b"c");
}
