use bigdecimal::{BigDecimal, ToPrimitive};
use common_cost::CentLedger;
use proptest::prelude::*;
use std::str::FromStr;
use uuid::Uuid;

proptest! {
    // The persisted whole cents must always stay within one cent of the exact
    // running total, and the gap must equal the outstanding remainder.
    #[test]
    fn settled_sum_tracks_exact_total(costs in proptest::collection::vec(0u32..50_000, 1..200)) {
        let ledger = CentLedger::new();
        let tenant = Uuid::new_v4();
        let mut exact = BigDecimal::from(0);
        let mut settled: i64 = 0;
        for milli_cents in costs {
            // Cost in decimal cents with three fractional digits.
            let cost = BigDecimal::from_str(&format!("{}.{:03}", milli_cents / 1000, milli_cents % 1000)).unwrap();
            exact += &cost;
            settled += ledger.settle(tenant, &cost);
        }
        let gap = &exact - BigDecimal::from(settled);
        prop_assert!(gap >= BigDecimal::from(0));
        prop_assert!(gap < BigDecimal::from(1));
        prop_assert_eq!(gap, ledger.outstanding(tenant));
    }

    #[test]
    fn settle_matches_floor_of_total(a in 0u32..10_000, b in 0u32..10_000) {
        let ledger = CentLedger::new();
        let tenant = Uuid::new_v4();
        let ca = BigDecimal::from_str(&format!("0.{:04}", a)).unwrap();
        let cb = BigDecimal::from_str(&format!("0.{:04}", b)).unwrap();
        let total = ledger.settle(tenant, &ca) + ledger.settle(tenant, &cb);
        let exact = (&ca + &cb).with_scale(0).to_i64().unwrap();
        prop_assert_eq!(total, exact);
    }
}
