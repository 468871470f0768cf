//! Gas and fee calculation.

use crate::error::FulfillmentError;
use crate::types::RandomnessRequest;

/// An internal call forwards at most 63/64 of remaining gas, so the
/// coordinator must hold back `requested / 63` extra to deliver `requested`.
pub const FORWARD_RETAIN_DIVISOR: u64 = 63;

pub const FEE_TIERS: usize = 5;

/// Flat fee schedule keyed by a subscription's lifetime request count.
///
/// `reqs_for_tier[i]` is the boundary above which tier `i + 2` applies:
/// a count `c` with `c <= reqs_for_tier[0]` pays `fees[0]`, a count with
/// `reqs_for_tier[0] < c <= reqs_for_tier[1]` pays `fees[1]`, and so on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeSchedule {
    pub fees: [u64; FEE_TIERS],
    pub reqs_for_tier: [u64; FEE_TIERS - 1],
}

impl FeeSchedule {
    /// Boundaries must be non-decreasing.
    pub fn validate(&self) -> Result<(), String> {
        if self.reqs_for_tier.windows(2).any(|w| w[0] > w[1]) {
            return Err(format!(
                "tier boundaries must be non-decreasing: {:?}",
                self.reqs_for_tier
            ));
        }
        Ok(())
    }

    /// Zero-based tier index for a lifetime request count.
    pub fn tier(&self, req_count: u64) -> usize {
        self.reqs_for_tier
            .iter()
            .position(|&bound| req_count <= bound)
            .unwrap_or(FEE_TIERS - 1)
    }

    pub fn flat_fee(&self, req_count: u64) -> u64 {
        self.fees[self.tier(req_count)]
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            fees: [1000, 1000, 100, 10, 1],
            reqs_for_tier: [10, 20, 30, 40],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasConfig {
    pub coordinator_overhead: u64,
    pub block_gas_ceiling: u64,
    /// Gas-currency units per fee-currency unit.
    pub native_per_fee_unit: u64,
    pub fee_schedule: FeeSchedule,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            coordinator_overhead: 90_000,
            block_gas_ceiling: 30_000_000,
            native_per_fee_unit: 1,
            fee_schedule: FeeSchedule::default(),
        }
    }
}

/// `requested + ceil(requested / 63) + overhead`.
pub fn effective_gas_limit(requested: u32, overhead: u64) -> u64 {
    let requested = u64::from(requested);
    requested + requested.div_ceil(FORWARD_RETAIN_DIVISOR) + overhead
}

/// `min(lane max, network estimate)`, deferring while the estimate is above
/// the lane's ceiling.
pub fn select_gas_price(lane_max: u64, estimate: u64) -> Result<u64, FulfillmentError> {
    if estimate > lane_max {
        return Err(FulfillmentError::PriceAboveLaneMax {
            estimate,
            max: lane_max,
        });
    }
    Ok(estimate.min(lane_max))
}

/// Priced fulfillment for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    pub gas_limit: u64,
    pub gas_price: u64,
    pub flat_fee: u64,
    /// Upper bound of what the subscription is charged, in fee-currency units.
    pub max_payment: u64,
}

#[derive(Debug, Clone)]
pub struct GasCalculator {
    config: GasConfig,
}

impl GasCalculator {
    pub fn new(config: GasConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GasConfig {
        &self.config
    }

    /// Price a request for a subscription with `req_count` lifetime requests.
    pub fn quote(
        &self,
        request: &RandomnessRequest,
        req_count: u64,
        network_estimate: u64,
        lane_max: u64,
    ) -> Result<FeeQuote, FulfillmentError> {
        let gas_limit =
            effective_gas_limit(request.callback_gas_limit, self.config.coordinator_overhead);
        if gas_limit > self.config.block_gas_ceiling {
            return Err(FulfillmentError::GasLimitAboveCeiling {
                effective: gas_limit,
                ceiling: self.config.block_gas_ceiling,
            });
        }

        let gas_price = select_gas_price(lane_max, network_estimate)?;
        let flat_fee = self.config.fee_schedule.flat_fee(req_count);
        let max_payment = self.max_payment(gas_limit, gas_price, flat_fee);

        Ok(FeeQuote {
            gas_limit,
            gas_price,
            flat_fee,
            max_payment,
        })
    }

    /// `ceil(gas_limit * gas_price / native_per_fee_unit) + flat_fee`, saturating.
    pub fn max_payment(&self, gas_limit: u64, gas_price: u64, flat_fee: u64) -> u64 {
        let native = u128::from(gas_limit) * u128::from(gas_price);
        let per_unit = u128::from(self.config.native_per_fee_unit.max(1));
        let gas_fee = native.div_ceil(per_unit);
        u64::try_from(gas_fee + u128::from(flat_fee)).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_request;
    use crate::types::KeyHash;

    #[test]
    fn effective_limit_reserves_forwarding_share() {
        // 2_500_000 / 63 = 39_682.5..., rounded up.
        assert_eq!(effective_gas_limit(2_500_000, 90_000), 2_500_000 + 39_683 + 90_000);
        assert_eq!(effective_gas_limit(63, 0), 64);
        assert_eq!(effective_gas_limit(0, 90_000), 90_000);
    }

    #[test]
    fn over_ceiling_is_unfulfillable() {
        let calc = GasCalculator::new(GasConfig {
            block_gas_ceiling: 2_500_000,
            ..GasConfig::default()
        });
        let req = sample_request(KeyHash([0; 32]), 1, 2_500_000, 10);
        let err = calc.quote(&req, 0, 1, 10).unwrap_err();
        assert!(matches!(err, FulfillmentError::GasLimitAboveCeiling { .. }));
    }

    #[test]
    fn price_above_lane_max_defers() {
        assert_eq!(select_gas_price(10, 7).unwrap(), 7);
        assert_eq!(select_gas_price(10, 10).unwrap(), 10);
        assert_eq!(
            select_gas_price(10, 11).unwrap_err(),
            FulfillmentError::PriceAboveLaneMax { estimate: 11, max: 10 }
        );
    }

    #[test]
    fn tier_boundaries_are_inclusive() {
        let schedule = FeeSchedule::default();
        assert_eq!(schedule.tier(0), 0);
        assert_eq!(schedule.tier(10), 0);
        assert_eq!(schedule.tier(11), 1);
        assert_eq!(schedule.tier(20), 1);
        assert_eq!(schedule.tier(21), 2);
        assert_eq!(schedule.tier(40), 3);
        assert_eq!(schedule.tier(41), 4);
        assert_eq!(schedule.tier(u64::MAX), 4);
    }

    #[test]
    fn fee_drops_after_tenth_request() {
        let schedule = FeeSchedule {
            fees: [1000, 500, 100, 10, 1],
            reqs_for_tier: [10, 20, 30, 40],
        };
        // The subscription's count includes the request being fulfilled.
        for count in 1..=10 {
            assert_eq!(schedule.flat_fee(count), 1000);
        }
        assert_eq!(schedule.flat_fee(11), 500);
    }

    #[test]
    fn funding_for_ten_tier_one_requests_then_cheaper() {
        let calc = GasCalculator::new(GasConfig {
            fee_schedule: FeeSchedule {
                fees: [1000, 500, 100, 10, 1],
                reqs_for_tier: [10, 20, 30, 40],
            },
            ..GasConfig::default()
        });
        let req = sample_request(KeyHash([0; 32]), 1, 50_000, 10);
        let tenth = calc.quote(&req, 10, 0, 10).unwrap();
        let eleventh = calc.quote(&req, 11, 0, 10).unwrap();
        assert_eq!(tenth.max_payment, 1000);
        assert_eq!(eleventh.max_payment, 500);
        assert!(eleventh.flat_fee < tenth.flat_fee);
    }

    #[test]
    fn max_payment_converts_and_rounds_up() {
        let calc = GasCalculator::new(GasConfig {
            native_per_fee_unit: 3,
            ..GasConfig::default()
        });
        assert_eq!(calc.max_payment(10, 1, 5), 4 + 5);
        assert_eq!(calc.max_payment(u64::MAX, u64::MAX, 1), u64::MAX);
    }

    #[test]
    fn rejects_decreasing_boundaries() {
        let schedule = FeeSchedule {
            fees: [1; 5],
            reqs_for_tier: [10, 5, 30, 40],
        };
        assert!(schedule.validate().is_err());
        assert!(FeeSchedule::default().validate().is_ok());
    }
}
