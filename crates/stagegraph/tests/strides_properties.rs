use proptest::prelude::*;
use stagegraph::{DimStride, StridesRequirement};

fn dim_stride() -> impl Strategy<Value = DimStride> {
    prop_oneof![
        Just(DimStride::Any),
        Just(DimStride::Compact),
        (1u32..5).prop_map(|units| DimStride::Fixed(units * 4)),
    ]
}

proptest! {
    #[test]
    fn concrete_slots_never_loosen(demands in prop::collection::vec((0usize..5, dim_stride()), 0..32)) {
        let mut req = StridesRequirement::empty();
        for (pos, demanded) in demands {
            let before = req;
            match req.tighten(pos, demanded) {
                Ok(changed) => {
                    prop_assert_eq!(changed, before != req);
                    if before.get(pos).is_concrete() {
                        prop_assert_eq!(req.get(pos), before.get(pos));
                    }
                }
                Err(conflict) => {
                    prop_assert_eq!(req, before);
                    prop_assert_eq!(conflict.existing, before.get(pos));
                    prop_assert!(conflict.existing.is_concrete() && demanded.is_concrete());
                    prop_assert_ne!(conflict.existing, demanded);
                }
            }
        }
    }

    #[test]
    fn merging_twice_is_a_no_op(demands in prop::collection::vec((0usize..5, dim_stride()), 0..8)) {
        let mut other = StridesRequirement::empty();
        for (pos, demanded) in demands {
            other.set(pos, demanded);
        }
        let mut req = StridesRequirement::empty();
        prop_assert_eq!(req.merge(&other), Ok(!other.is_empty()));
        prop_assert_eq!(req, other);
        prop_assert_eq!(req.merge(&other), Ok(false));
    }
}
