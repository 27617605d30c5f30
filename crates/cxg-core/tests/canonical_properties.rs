// SPDX-License-Identifier: Apache-2.0

use cxg_core::{canonical_query, query_fingerprint};
use proptest::prelude::*;
use proptest::test_runner::Config;

proptest! {
    #![proptest_config(Config::with_cases(128))]
    #[test]
    fn fingerprint_ignores_parameter_order(
        pairs in proptest::collection::vec(("[a-z:_0-9]{1,8}", "[A-Za-z0-9 ]{0,8}"), 0..12),
        seed in any::<u64>()
    ) {
        let mut shuffled = pairs.clone();
        // deterministic rotation + reversal covers reorderings without an rng
        if !shuffled.is_empty() {
            let k = (seed as usize) % shuffled.len();
            shuffled.rotate_left(k);
            if seed % 2 == 0 {
                shuffled.reverse();
            }
        }
        prop_assert_eq!(canonical_query(&pairs), canonical_query(&shuffled));
        prop_assert_eq!(query_fingerprint(&pairs), query_fingerprint(&shuffled));
    }
}
