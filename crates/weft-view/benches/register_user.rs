use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use weft_event::EventTable;
use weft_expr::RowSet;
use weft_types::{FieldMask, InstanceId, OperationId, RegionUsage, RequirementIndex};
use weft_view::{InstanceView, ViewConfig, ViewKind};

fn whole_domain() -> RowSet {
    RowSet::interval(0, 1 << 16).expect("valid interval")
}

fn fresh_view() -> InstanceView {
    InstanceView::new(
        InstanceId(1),
        whole_domain(),
        ViewKind::Materialized,
        EventTable::new(),
        ViewConfig::default(),
    )
}

/// Repeated registration at the root node: the congruent fast path.
fn bench_register_exact(c: &mut Criterion) {
    c.bench_function("register_user/exact_match", |b| {
        b.iter_batched(
            fresh_view,
            |view| {
                let domain = whole_domain();
                let mask = FieldMask::single(0).expect("field 0 in range");
                for i in 0..64_u64 {
                    let term = view.events().create();
                    view.register_user(
                        RegionUsage::read_only(),
                        mask,
                        &domain,
                        OperationId(i + 1),
                        RequirementIndex(0),
                        term,
                    );
                }
            },
            BatchSize::SmallInput,
        );
    });
}

/// Registration over strided sub-windows: exercises node creation, the
/// expr cache, and the clean pass.
fn bench_register_subsets(c: &mut Criterion) {
    c.bench_function("register_user/strided_subsets", |b| {
        b.iter_batched(
            fresh_view,
            |view| {
                let mask = FieldMask::single(0).expect("field 0 in range");
                for i in 0..64_u64 {
                    let start = (i * 509) % (1 << 15);
                    let expr = RowSet::interval(start, start + 256).expect("valid interval");
                    let term = view.events().create();
                    view.register_user(
                        RegionUsage::read_write(),
                        mask,
                        &expr,
                        OperationId(i + 1),
                        RequirementIndex(0),
                        term,
                    );
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_register_exact, bench_register_subsets);
criterion_main!(benches);
