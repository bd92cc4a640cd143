//! Property tests for the round-trip invariants spec §8 calls out: type
//! identifiers and digests must survive a `Display` → `FromStr` cycle
//! unchanged for any value the respective constructors can produce.

use ocm_core::digest::Digest;
use ocm_core::scheme::TypeId;
use proptest::prelude::*;
use std::str::FromStr;

fn type_name_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9]{0,20}"
}

fn version_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9._-]{1,10}"
}

proptest! {
    #[test]
    fn type_id_round_trips_through_display(name in type_name_strategy(), version in proptest::option::of(version_strategy())) {
        let t = TypeId::new(name, version).expect("constructed type id must be valid");
        let rendered = t.to_string();
        let parsed = TypeId::from_str(&rendered).expect("rendered type id must reparse");
        prop_assert_eq!(t, parsed);
    }

    #[test]
    fn digest_round_trips_through_display(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let digest = Digest::sha256(&bytes);
        let rendered = digest.to_string();
        let parsed = Digest::from_str(&rendered).expect("rendered digest must reparse");
        prop_assert_eq!(digest, parsed);
    }
}
