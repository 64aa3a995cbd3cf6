//! Money arithmetic and order/checkout recalculation.
//!
//! Recalculation is a pure function of the current lines, discounts and
//! shipping price. Callers always recompute from scratch and persist the
//! result; nothing here is applied incrementally.

use std::ops::{Add, AddAssign};

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::order_discount::DiscountValueType;

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxedMoney {
    pub net: Decimal,
    pub gross: Decimal,
}

impl TaxedMoney {
    pub const ZERO: TaxedMoney = TaxedMoney {
        net: Decimal::ZERO,
        gross: Decimal::ZERO,
    };

    pub fn new(net: Decimal, gross: Decimal) -> Self {
        Self { net, gross }
    }

    pub fn untaxed(amount: Decimal) -> Self {
        Self::new(amount, amount)
    }

    pub fn tax(&self) -> Decimal {
        self.gross - self.net
    }
}

impl Add for TaxedMoney {
    type Output = TaxedMoney;

    fn add(self, rhs: TaxedMoney) -> TaxedMoney {
        TaxedMoney::new(self.net + rhs.net, self.gross + rhs.gross)
    }
}

impl AddAssign for TaxedMoney {
    fn add_assign(&mut self, rhs: TaxedMoney) {
        self.net += rhs.net;
        self.gross += rhs.gross;
    }
}

/// What a pricing provider may look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingContext {
    pub channel_id: Uuid,
    pub currency: String,
    pub country_code: String,
}

/// Turns net amounts into taxed amounts. Implementations must be pure.
pub trait PricingProvider: Send + Sync {
    fn line_price(&self, ctx: &PricingContext, net: Decimal) -> TaxedMoney;

    fn shipping_price(&self, ctx: &PricingContext, net: Decimal) -> TaxedMoney;
}

/// Applies one flat tax rate to every amount.
#[derive(Debug, Clone, Copy)]
pub struct FlatTaxPricing {
    rate: Decimal,
}

impl FlatTaxPricing {
    pub fn new(rate: Decimal) -> Self {
        Self { rate }
    }

    pub fn from_rate(rate: f64) -> Self {
        Self::new(Decimal::try_from(rate).unwrap_or_default().round_dp(4))
    }

    fn apply(&self, net: Decimal) -> TaxedMoney {
        let net = round_money(net);
        TaxedMoney::new(net, round_money(net * (Decimal::ONE + self.rate)))
    }
}

impl PricingProvider for FlatTaxPricing {
    fn line_price(&self, _ctx: &PricingContext, net: Decimal) -> TaxedMoney {
        self.apply(net)
    }

    fn shipping_price(&self, _ctx: &PricingContext, net: Decimal) -> TaxedMoney {
        self.apply(net)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discount {
    pub value_type: DiscountValueType,
    pub value: Decimal,
}

impl Discount {
    pub fn fixed(value: Decimal) -> Self {
        Self {
            value_type: DiscountValueType::Fixed,
            value,
        }
    }

    pub fn percentage(value: Decimal) -> Self {
        Self {
            value_type: DiscountValueType::Percentage,
            value,
        }
    }

    /// Amount taken off `base`, never more than `base` itself.
    pub fn amount_for(&self, base: Decimal) -> Decimal {
        let amount = match self.value_type {
            DiscountValueType::Fixed => self.value,
            DiscountValueType::Percentage => round_money(base * self.value / Decimal::ONE_HUNDRED),
        };
        amount.min(base).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct LineInput {
    pub line_id: Uuid,
    pub quantity: i32,
    pub base_unit_price: Decimal,
    pub discount: Option<Discount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinePrice {
    pub line_id: Uuid,
    pub undiscounted_unit: TaxedMoney,
    pub undiscounted_total: TaxedMoney,
    pub unit: TaxedMoney,
    pub total: TaxedMoney,
    pub unit_discount_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recalculation {
    pub lines: Vec<LinePrice>,
    /// Amount of each order-level discount, in input order.
    pub discount_amounts: Vec<Decimal>,
    pub undiscounted_total: TaxedMoney,
    pub subtotal: TaxedMoney,
    pub shipping: TaxedMoney,
    pub total: TaxedMoney,
}

impl Recalculation {
    pub fn line(&self, line_id: Uuid) -> Option<&LinePrice> {
        self.lines.iter().find(|line| line.line_id == line_id)
    }
}

/// Recomputes every price of an order or checkout.
///
/// Line discounts come first. Order discounts are then applied one after the
/// other against the running subtotal and spread over the lines in
/// proportion to their totals, the last line taking the rounding remainder.
pub fn recalculate(
    provider: &dyn PricingProvider,
    ctx: &PricingContext,
    lines: &[LineInput],
    order_discounts: &[Discount],
    shipping_net: Option<Decimal>,
) -> Recalculation {
    let mut unit_discounts = Vec::with_capacity(lines.len());
    let mut line_totals = Vec::with_capacity(lines.len());
    for line in lines {
        let unit_discount = line
            .discount
            .map(|discount| discount.amount_for(line.base_unit_price))
            .unwrap_or_default();
        unit_discounts.push(unit_discount);
        line_totals.push((line.base_unit_price - unit_discount) * Decimal::from(line.quantity));
    }

    let discountable: Decimal = line_totals.iter().copied().sum();
    let mut remaining = discountable;
    let discount_amounts: Vec<Decimal> = order_discounts
        .iter()
        .map(|discount| {
            let amount = discount.amount_for(remaining);
            remaining -= amount;
            amount
        })
        .collect();
    let order_discount: Decimal = discount_amounts.iter().copied().sum();

    let mut distributed = Decimal::ZERO;
    let mut priced = Vec::with_capacity(lines.len());
    let mut subtotal = TaxedMoney::ZERO;
    let mut undiscounted_total = TaxedMoney::ZERO;
    for (index, line) in lines.iter().enumerate() {
        let line_total = line_totals[index];
        let share = if order_discount.is_zero() || discountable.is_zero() {
            Decimal::ZERO
        } else if index + 1 == lines.len() {
            (order_discount - distributed).min(line_total)
        } else {
            round_money(order_discount * line_total / discountable)
                .min(line_total)
                .min(order_discount - distributed)
        };
        distributed += share;

        let total_net = line_total - share;
        let unit_net = if line.quantity > 0 {
            round_money(total_net / Decimal::from(line.quantity))
        } else {
            Decimal::ZERO
        };
        let undiscounted_line =
            provider.line_price(ctx, line.base_unit_price * Decimal::from(line.quantity));
        let total = provider.line_price(ctx, total_net);

        subtotal += total;
        undiscounted_total += undiscounted_line;
        priced.push(LinePrice {
            line_id: line.line_id,
            undiscounted_unit: provider.line_price(ctx, line.base_unit_price),
            undiscounted_total: undiscounted_line,
            unit: provider.line_price(ctx, unit_net),
            total,
            unit_discount_amount: unit_discounts[index],
        });
    }

    let shipping = shipping_net
        .map(|net| provider.shipping_price(ctx, net))
        .unwrap_or(TaxedMoney::ZERO);

    Recalculation {
        lines: priced,
        discount_amounts,
        undiscounted_total: undiscounted_total + shipping,
        subtotal,
        shipping,
        total: subtotal + shipping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn ctx() -> PricingContext {
        PricingContext {
            channel_id: Uuid::nil(),
            currency: "USD".into(),
            country_code: "US".into(),
        }
    }

    fn line(price: Decimal, quantity: i32) -> LineInput {
        LineInput {
            line_id: Uuid::new_v4(),
            quantity,
            base_unit_price: price,
            discount: None,
        }
    }

    #[test]
    fn flat_tax_applies_to_lines_and_shipping() {
        let pricing = FlatTaxPricing::new(dec!(0.10));
        let result = recalculate(&pricing, &ctx(), &[line(dec!(10), 2)], &[], Some(dec!(5)));

        assert_eq!(result.subtotal, TaxedMoney::new(dec!(20), dec!(22)));
        assert_eq!(result.shipping, TaxedMoney::new(dec!(5), dec!(5.5)));
        assert_eq!(result.total, TaxedMoney::new(dec!(25), dec!(27.5)));
        assert_eq!(result.undiscounted_total, result.total);
    }

    #[test]
    fn percentage_order_discount_is_spread_proportionally() {
        let pricing = FlatTaxPricing::new(Decimal::ZERO);
        let lines = [line(dec!(30), 1), line(dec!(10), 1)];
        let result = recalculate(
            &pricing,
            &ctx(),
            &lines,
            &[Discount::percentage(dec!(10))],
            None,
        );

        assert_eq!(result.discount_amounts, vec![dec!(4)]);
        assert_eq!(result.lines[0].total.net, dec!(27));
        assert_eq!(result.lines[1].total.net, dec!(9));
        assert_eq!(result.subtotal.net, dec!(36));
        assert_eq!(result.undiscounted_total.net, dec!(40));
    }

    #[test]
    fn rounding_remainder_lands_on_last_line() {
        let pricing = FlatTaxPricing::new(Decimal::ZERO);
        let lines = [line(dec!(10), 1), line(dec!(10), 1), line(dec!(10), 1)];
        let result = recalculate(&pricing, &ctx(), &lines, &[Discount::fixed(dec!(10))], None);

        let shares: Vec<Decimal> = result
            .lines
            .iter()
            .map(|line| dec!(10) - line.total.net)
            .collect();
        assert_eq!(shares, vec![dec!(3.33), dec!(3.33), dec!(3.34)]);
        assert_eq!(result.subtotal.net, dec!(20));
    }

    #[test]
    fn stacked_discounts_never_exceed_subtotal() {
        let pricing = FlatTaxPricing::new(Decimal::ZERO);
        let result = recalculate(
            &pricing,
            &ctx(),
            &[line(dec!(15), 1)],
            &[Discount::fixed(dec!(10)), Discount::fixed(dec!(10))],
            Some(dec!(4)),
        );

        assert_eq!(result.discount_amounts, vec![dec!(10), dec!(5)]);
        assert_eq!(result.subtotal.net, Decimal::ZERO);
        assert_eq!(result.total.net, dec!(4));
    }

    #[test]
    fn line_discount_reduces_unit_price() {
        let pricing = FlatTaxPricing::new(Decimal::ZERO);
        let mut discounted = line(dec!(9.99), 2);
        discounted.discount = Some(Discount::percentage(dec!(50)));
        let result = recalculate(&pricing, &ctx(), &[discounted], &[], None);

        assert_eq!(result.lines[0].unit_discount_amount, dec!(5.00));
        assert_eq!(result.lines[0].unit.net, dec!(4.99));
        assert_eq!(result.lines[0].undiscounted_unit.net, dec!(9.99));
        assert_eq!(result.subtotal.net, dec!(9.98));
    }

    #[test]
    fn adding_then_removing_a_line_restores_totals() {
        let pricing = FlatTaxPricing::new(dec!(0.23));
        let discounts = [Discount::percentage(dec!(15))];
        let base = vec![line(dec!(19.99), 3), line(dec!(4.5), 1)];
        let before = recalculate(&pricing, &ctx(), &base, &discounts, Some(dec!(7.5)));

        let mut extended = base.clone();
        extended.push(line(dec!(120), 2));
        let during = recalculate(&pricing, &ctx(), &extended, &discounts, Some(dec!(7.5)));
        assert_ne!(during.total, before.total);

        extended.pop();
        let after = recalculate(&pricing, &ctx(), &extended, &discounts, Some(dec!(7.5)));
        assert_eq!(after.total, before.total);
        assert_eq!(after.subtotal, before.subtotal);
        assert_eq!(after.discount_amounts, before.discount_amounts);
    }

    proptest! {
        #[test]
        fn order_discounts_stay_within_the_lines(
            lines in prop::collection::vec((1i64..50_000, 1i32..20), 1..8),
            fixed_cents in 0i64..200_000,
            percent in 0u32..=100,
        ) {
            let pricing = FlatTaxPricing::new(Decimal::ZERO);
            let inputs: Vec<LineInput> = lines
                .iter()
                .map(|(cents, quantity)| line(Decimal::new(*cents, 2), *quantity))
                .collect();
            let discounts = [
                Discount::fixed(Decimal::new(fixed_cents, 2)),
                Discount::percentage(Decimal::from(percent)),
            ];
            let result = recalculate(&pricing, &ctx(), &inputs, &discounts, None);

            let discountable = result.undiscounted_total.net;
            let taken: Decimal = result.discount_amounts.iter().copied().sum();
            prop_assert!(taken <= discountable);
            for priced in &result.lines {
                prop_assert!(priced.total.net >= Decimal::ZERO);
                prop_assert!(priced.total.net <= priced.undiscounted_total.net);
            }
            prop_assert!(result.subtotal.net >= discountable - taken);
            prop_assert!(result.subtotal.net <= discountable);
            prop_assert_eq!(result.total, result.subtotal + result.shipping);
        }
    }
}
