//! Costing engine: how a movement changes a position's unit cost.
//!
//! Only weighted-average costing is provided. The trait is the seam where a
//! FIFO/LIFO engine would plug in.

use rust_decimal::{Decimal, RoundingStrategy};
use stockledger_core::{DomainError, DomainResult};

use crate::movement::{BalanceSnapshot, Direction};

/// Default number of decimal places kept on average costs.
pub const DEFAULT_COST_SCALE: u32 = 2;

/// Pure function from (current balance, incoming movement) to the new balance.
pub trait CostingEngine: core::fmt::Debug + Send + Sync {
    /// Stable engine name (recorded in logs).
    fn name(&self) -> &'static str;

    /// Balance after a movement of `quantity` (> 0) units in `direction`.
    ///
    /// `unit_cost` is only meaningful for inbound movements. Fails with a
    /// validation error when the result does not fit in a `Decimal`.
    fn apply(
        &self,
        current: BalanceSnapshot,
        direction: Direction,
        quantity: Decimal,
        unit_cost: Decimal,
    ) -> DomainResult<BalanceSnapshot>;
}

/// Weighted-average cost, rounded half-up to a fixed scale.
///
/// Inbound: `avg = (q0·c0 + q·c) / (q0 + q)`. Outbound: average unchanged.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WeightedAverageCost {
    scale: u32,
}

impl WeightedAverageCost {
    pub fn new(scale: u32) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    fn round(&self, value: Decimal) -> Decimal {
        round_half_up(value, self.scale)
    }
}

impl Default for WeightedAverageCost {
    fn default() -> Self {
        Self::new(DEFAULT_COST_SCALE)
    }
}

impl CostingEngine for WeightedAverageCost {
    fn name(&self) -> &'static str {
        "weighted_average"
    }

    fn apply(
        &self,
        current: BalanceSnapshot,
        direction: Direction,
        quantity: Decimal,
        unit_cost: Decimal,
    ) -> DomainResult<BalanceSnapshot> {
        match direction {
            Direction::Outbound => {
                let quantity = current
                    .quantity
                    .checked_sub(quantity)
                    .ok_or_else(|| out_of_range("stock quantity"))?;
                Ok(BalanceSnapshot::new(quantity, current.average_cost))
            }
            Direction::Inbound => {
                let new_quantity = current
                    .quantity
                    .checked_add(quantity)
                    .ok_or_else(|| out_of_range("stock quantity"))?;
                let average_cost = if new_quantity.is_zero() {
                    current.average_cost
                } else if current.quantity < Decimal::ZERO {
                    // A deficit carries no on-hand value to weigh against.
                    self.round(unit_cost)
                } else {
                    let total = current
                        .value()
                        .zip(quantity.checked_mul(unit_cost))
                        .and_then(|(held, incoming)| held.checked_add(incoming))
                        .ok_or_else(|| out_of_range("inventory value"))?;
                    let average = total
                        .checked_div(new_quantity)
                        .ok_or_else(|| out_of_range("average cost"))?;
                    self.round(average)
                };
                Ok(BalanceSnapshot::new(new_quantity, average_cost))
            }
        }
    }
}

pub(crate) fn out_of_range(what: &str) -> DomainError {
    DomainError::validation(format!("{what} exceeds the supported decimal range"))
}

/// Round to `scale` decimal places, halves away from zero.
pub fn round_half_up(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn engine() -> WeightedAverageCost {
        WeightedAverageCost::new(2)
    }

    #[test]
    fn inbound_recomputes_weighted_average() {
        let out = engine().apply(
            BalanceSnapshot::new(dec!(10), dec!(100)),
            Direction::Inbound,
            dec!(5),
            dec!(130),
        )
        .unwrap();
        assert_eq!(out.quantity, dec!(15));
        assert_eq!(out.average_cost, dec!(110.00));
    }

    #[test]
    fn first_receipt_takes_incoming_cost() {
        let out = engine()
            .apply(BalanceSnapshot::ZERO, Direction::Inbound, dec!(3), dec!(7.5))
            .unwrap();
        assert_eq!(out, BalanceSnapshot::new(dec!(3), dec!(7.50)));
    }

    #[test]
    fn outbound_keeps_average_cost() {
        let out = engine().apply(
            BalanceSnapshot::new(dec!(10), dec!(12.34)),
            Direction::Outbound,
            dec!(4),
            dec!(999),
        )
        .unwrap();
        assert_eq!(out, BalanceSnapshot::new(dec!(6), dec!(12.34)));
    }

    #[test]
    fn zero_denominator_keeps_previous_average() {
        let out = engine().apply(
            BalanceSnapshot::new(dec!(-5), dec!(20)),
            Direction::Inbound,
            dec!(5),
            dec!(30),
        )
        .unwrap();
        assert_eq!(out, BalanceSnapshot::new(dec!(0), dec!(20)));
    }

    #[test]
    fn receipt_into_deficit_takes_incoming_cost() {
        let out = engine().apply(
            BalanceSnapshot::new(dec!(-2), dec!(20)),
            Direction::Inbound,
            dec!(5),
            dec!(31),
        )
        .unwrap();
        assert_eq!(out, BalanceSnapshot::new(dec!(3), dec!(31.00)));
    }

    #[test]
    fn rounding_is_half_up() {
        // (1·0 + 2·0.01) / 3 = 0.00666..., and (1·0 + 1·0.01) / 2 = 0.005
        let thirds = engine().apply(
            BalanceSnapshot::new(dec!(1), dec!(0)),
            Direction::Inbound,
            dec!(2),
            dec!(0.01),
        )
        .unwrap();
        assert_eq!(thirds.average_cost, dec!(0.01));

        let half = engine().apply(
            BalanceSnapshot::new(dec!(1), dec!(0)),
            Direction::Inbound,
            dec!(1),
            dec!(0.01),
        )
        .unwrap();
        assert_eq!(half.average_cost, dec!(0.01));
        assert_eq!(round_half_up(dec!(-0.005), 2), dec!(-0.01));
    }

    #[test]
    fn unrepresentable_value_is_rejected() {
        let huge = dec!(100000000000000000000);
        let err = engine()
            .apply(BalanceSnapshot::ZERO, Direction::Inbound, huge, dec!(10000000000))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = engine()
            .apply(
                BalanceSnapshot::new(Decimal::MAX, dec!(1)),
                Direction::Inbound,
                dec!(1),
                dec!(1),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = engine()
            .apply(
                BalanceSnapshot::new(Decimal::MIN, dec!(1)),
                Direction::Outbound,
                dec!(1),
                Decimal::ZERO,
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: after a receipt into a non-negative position, the
        /// average lies between the old average and the incoming cost.
        #[test]
        fn average_stays_between_inputs(
            q0 in 0u32..10_000,
            c0 in 0u32..100_000,
            q in 1u32..10_000,
            c in 0u32..100_000,
        ) {
            let c0 = Decimal::new(c0 as i64, 2);
            let c = Decimal::new(c as i64, 2);
            let out = engine().apply(
                BalanceSnapshot::new(Decimal::from(q0), c0),
                Direction::Inbound,
                Decimal::from(q),
                c,
            )
            .unwrap();

            let (lo, hi) = if c0 <= c { (c0, c) } else { (c, c0) };
            let lo = if q0 == 0 { c } else { lo };
            prop_assert!(out.average_cost >= lo && out.average_cost <= hi);
            prop_assert_eq!(out.quantity, Decimal::from(q0 + q));
        }
    }
}
