use bigdecimal::{BigDecimal, ToPrimitive};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Compute the USD cost of a call from token counts and per-1000-token prices.
///
/// Prices are decimal USD per 1000 tokens; the result keeps full decimal
/// precision. Integer cents only appear at the ledger boundary.
pub fn token_cost_usd(
    input_tokens: i64,
    output_tokens: i64,
    price_input_per_k: &BigDecimal,
    price_output_per_k: &BigDecimal,
) -> BigDecimal {
    let thousand = BigDecimal::from(1000);
    let input = BigDecimal::from(input_tokens) * price_input_per_k;
    let output = BigDecimal::from(output_tokens) * price_output_per_k;
    (input + output) / thousand
}

/// USD to decimal cents (scale preserved).
pub fn usd_to_cents(usd: &BigDecimal) -> BigDecimal {
    usd * BigDecimal::from(100)
}

/// USD to integer micro-dollars, truncating sub-micro precision.
/// Stored alongside the cents ledger for auditing.
pub fn usd_to_micros(usd: &BigDecimal) -> i64 {
    (usd * BigDecimal::from(1_000_000))
        .with_scale(0)
        .to_i64()
        .unwrap_or(0)
}

/// Decimal cents from integer cents, for comparisons in callers.
pub fn cents_decimal(cents: i64) -> BigDecimal {
    BigDecimal::from(cents)
}

/// Per-tenant fractional-cent carryover.
///
/// Every call usually costs a fraction of a cent. The ledger accumulates the
/// exact decimal-cent cost per tenant and releases whole cents, keeping the
/// sub-cent remainder in memory so that persisted integer cents never drift
/// more than one cent from the exact running total.
#[derive(Default)]
pub struct CentLedger {
    remainders: Mutex<HashMap<Uuid, BigDecimal>>,
}

impl CentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `cost_cents` (decimal cents) to the tenant's remainder and return
    /// the whole cents to persist. The fractional part stays in the ledger.
    ///
    /// Lock is held for the map operation and the arithmetic only; no I/O.
    pub fn settle(&self, tenant_id: Uuid, cost_cents: &BigDecimal) -> i64 {
        let mut guard = self.remainders.lock().unwrap_or_else(|e| e.into_inner());
        let carried = guard.remove(&tenant_id).unwrap_or_default();
        let total = carried + cost_cents;
        let whole = total.with_scale(0);
        let fraction = &total - &whole;
        if fraction != BigDecimal::from(0) {
            guard.insert(tenant_id, fraction);
        }
        whole.to_i64().unwrap_or(0)
    }

    /// Outstanding sub-cent remainder for a tenant. Zero when unknown.
    pub fn outstanding(&self, tenant_id: Uuid) -> BigDecimal {
        let guard = self.remainders.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(&tenant_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn bd(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn token_cost_scales_per_thousand() {
        // 10 input at $0.50/1k + 5 output at $1.50/1k = 0.005 + 0.0075
        let cost = token_cost_usd(10, 5, &bd("0.50"), &bd("1.50"));
        assert_eq!(cost.with_scale(4), bd("0.0125"));
    }

    #[test]
    fn micros_truncate() {
        assert_eq!(usd_to_micros(&bd("0.0125")), 12_500);
        assert_eq!(usd_to_micros(&bd("0.00000099")), 0);
    }

    #[test]
    fn ledger_carries_fractions() {
        let ledger = CentLedger::new();
        let tenant = Uuid::new_v4();
        // 0.6 + 0.6 cents: first settle releases 0, second releases 1.
        assert_eq!(ledger.settle(tenant, &bd("0.6")), 0);
        assert_eq!(ledger.settle(tenant, &bd("0.6")), 1);
        assert_eq!(ledger.outstanding(tenant), bd("0.2"));
    }

    #[test]
    fn ledger_isolated_per_tenant() {
        let ledger = CentLedger::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(ledger.settle(a, &bd("0.9")), 0);
        assert_eq!(ledger.settle(b, &bd("1.9")), 1);
        assert_eq!(ledger.outstanding(a), bd("0.9"));
        assert_eq!(ledger.outstanding(b), bd("0.9"));
    }
}
