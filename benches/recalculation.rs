use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;
use uuid::Uuid;

use order_engine::entities::payment::ChargeStatus;
use order_engine::entities::payment_transaction::TransactionKind;
use order_engine::services::payments::{apply_transition, ChargeState};
use order_engine::services::pricing::{
    recalculate, Discount, FlatTaxPricing, LineInput, PricingContext,
};

fn context() -> PricingContext {
    PricingContext {
        channel_id: Uuid::nil(),
        currency: "USD".to_string(),
        country_code: "US".to_string(),
    }
}

fn lines(count: usize) -> Vec<LineInput> {
    (0..count)
        .map(|i| LineInput {
            line_id: Uuid::new_v4(),
            quantity: (i % 5) as i32 + 1,
            base_unit_price: Decimal::from(i as i64 + 1) + dec!(0.99),
            discount: (i % 3 == 0).then(|| Discount::percentage(dec!(15))),
        })
        .collect()
}

// Full price recomputation of an order with line and order discounts
fn recalculation_benchmark(c: &mut Criterion) {
    let pricing = FlatTaxPricing::new(dec!(0.0825));
    let ctx = context();
    let order_discounts = [Discount::fixed(dec!(5.00)), Discount::percentage(dec!(10))];
    let mut group = c.benchmark_group("recalculate");

    for size in [1, 10, 50, 200].iter() {
        let input = lines(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| {
                recalculate(
                    &pricing,
                    &ctx,
                    black_box(input),
                    black_box(&order_discounts),
                    Some(dec!(7.50)),
                )
            });
        });
    }

    group.finish();
}

// Charge state machine: capture in parts, then refund
fn charge_transition_benchmark(c: &mut Criterion) {
    let start = ChargeState {
        charge_status: ChargeStatus::NotCharged,
        captured_amount: Decimal::ZERO,
        total: dec!(120.00),
        is_active: true,
        to_confirm: false,
    };

    c.bench_function("charge_transitions", |b| {
        b.iter(|| {
            let state = apply_transition(black_box(start), TransactionKind::Auth, dec!(120.00));
            let state = apply_transition(state, TransactionKind::Capture, dec!(40.00));
            let state = apply_transition(state, TransactionKind::Capture, dec!(80.00));
            apply_transition(state, TransactionKind::Refund, dec!(120.00))
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(100);
    targets =
        recalculation_benchmark,
        charge_transition_benchmark
}

criterion_main!(benches);
