//! Property-based tests for the segment datagram format.

use bytes::Bytes;
use proptest::prelude::*;
use vidbench_common::wire::*;

proptest! {
    /// Arbitrary input must decode to a value or an error, never panic.
    #[test]
    fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = Datagram::decode(Bytes::from(data));
    }

    #[test]
    fn request_fields_survive_encoding(
        request_id in any::<u32>(),
        quality_id in any::<u32>(),
        index in any::<u32>(),
    ) {
        let dg = Datagram::Request(SegmentRequest { request_id, quality_id, index });
        prop_assert_eq!(Datagram::decode(dg.encode().freeze()).unwrap(), dg);
    }

    /// Coalesced ranges cover exactly the missing indices.
    #[test]
    fn coalesced_ranges_cover_missing(missing in proptest::collection::btree_set(0u32..500, 0..60)) {
        let ranges = coalesce_ranges(missing.iter().copied());
        let covered: Vec<u32> = ranges
            .iter()
            .flat_map(|r| r.start..r.start + r.count)
            .collect();
        let expected: Vec<u32> = missing.into_iter().collect();
        prop_assert_eq!(covered, expected);
    }
}
