//! Table aliases for the engine's internal maps.
//!
//! Two properties matter for every table in this crate and neither is the
//! std default. Keys are dep-table property keys, target identities and
//! SameValue-keyed collection entries, none of which an attacker chooses,
//! so the DoS-resistant SipHash buys nothing; the tables run on foldhash
//! with a fixed seed instead. And insertion order is observable (record
//! key listing, collection iteration snapshots), which rules the unordered
//! std maps out in favor of indexmap.

use foldhash::fast::FixedState;

/// Insertion-ordered map over fixed-seed foldhash.
pub type FastIndexMap<K, V> = indexmap::IndexMap<K, V, FixedState>;

/// Insertion-ordered set over fixed-seed foldhash.
pub type FastIndexSet<T> = indexmap::IndexSet<T, FixedState>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn nan_keys_round_trip() {
        // SameValue hashing: every NaN is the same key.
        let mut table = FastIndexMap::default();
        table.insert(Value::Float(f64::NAN), 1);
        assert_eq!(table.get(&Value::Float(-f64::NAN)), Some(&1));
        assert!(!table.contains_key(&Value::Float(0.0)));
    }

    #[test]
    fn signed_zero_keys_stay_distinct() {
        let mut table = FastIndexMap::default();
        table.insert(Value::Float(0.0), "pos");
        table.insert(Value::Float(-0.0), "neg");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut keys = FastIndexSet::default();
        keys.insert("b");
        keys.insert("a");
        keys.insert("c");
        assert_eq!(keys.iter().copied().collect::<Vec<_>>(), ["b", "a", "c"]);
    }
}
