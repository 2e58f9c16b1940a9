use crate::amount::Amount;
use crate::types::{OperationKind, ResourceUsage};
use std::collections::HashMap;

/// Prices an attempt from what it did; the ledger caps the result at `max_budget`
pub trait CostPolicy: Send + Sync {
    fn cost(&self, kind: &OperationKind, usage: &ResourceUsage) -> Amount;
}

impl<F> CostPolicy for F
where
    F: Fn(&OperationKind, &ResourceUsage) -> Amount + Send + Sync,
{
    fn cost(&self, kind: &OperationKind, usage: &ResourceUsage) -> Amount {
        self(kind, usage)
    }
}

/// Base fee per operation kind plus metered usage
#[derive(Debug, Clone)]
pub struct MeteredCostPolicy {
    pub base_fees: HashMap<String, Amount>,
    pub default_base_fee: Amount,
    /// Price per million units of wasm fuel
    pub per_million_fuel: Amount,
    pub per_cpu_ms: Amount,
    pub per_external_call: Amount,
}

impl Default for MeteredCostPolicy {
    fn default() -> Self {
        let base_fees = HashMap::from([
            ("compute".to_string(), Amount::from_micros(10_000)),
            ("transfer".to_string(), Amount::from_micros(50_000)),
            ("stake".to_string(), Amount::from_micros(50_000)),
        ]);

        Self {
            base_fees,
            default_base_fee: Amount::from_micros(20_000),
            per_million_fuel: Amount::from_micros(1_000),
            per_cpu_ms: Amount::from_micros(10),
            per_external_call: Amount::from_micros(5_000),
        }
    }
}

impl CostPolicy for MeteredCostPolicy {
    fn cost(&self, kind: &OperationKind, usage: &ResourceUsage) -> Amount {
        let base = self
            .base_fees
            .get(kind.name())
            .copied()
            .unwrap_or(self.default_base_fee);

        // round partial units up so metered work is never free
        let fuel_units = usage.fuel_consumed.div_ceil(1_000_000);
        let cpu_ms = usage.cpu_time_us.div_ceil(1_000);

        base.saturating_add(self.per_million_fuel.saturating_mul(fuel_units))
            .saturating_add(self.per_cpu_ms.saturating_mul(cpu_ms))
            .saturating_add(self.per_external_call.saturating_mul(u64::from(usage.external_calls)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metered_cost() {
        let policy = MeteredCostPolicy::default();
        let usage = ResourceUsage {
            cpu_time_us: 2_500,
            memory_high_watermark: 65_536,
            external_calls: 1,
            fuel_consumed: 1_500_000,
        };
        // 0.01 base + 2 * 0.001 fuel + 3 * 0.00001 cpu + 0.005 call
        assert_eq!(
            policy.cost(&OperationKind::Compute, &usage),
            Amount::from_micros(10_000 + 2_000 + 30 + 5_000)
        );
    }

    #[test]
    fn test_custom_kind_uses_default_fee() {
        let policy = MeteredCostPolicy::default();
        let cost = policy.cost(&OperationKind::Custom("oracle".into()), &ResourceUsage::default());
        assert_eq!(cost, policy.default_base_fee);
    }

    #[test]
    fn test_closure_policy() {
        let flat = |_: &OperationKind, _: &ResourceUsage| Amount::from_micros(4_500_000);
        assert_eq!(
            flat.cost(&OperationKind::Compute, &ResourceUsage::default()),
            Amount::from_micros(4_500_000)
        );
    }
}
