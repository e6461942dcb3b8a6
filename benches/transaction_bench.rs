// Transaction engine benchmarks: lifecycle, read path, write path, and the
// full transfer workload.

use std::hint::black_box;
use std::sync::atomic::{AtomicI64, Ordering};

use criterion::{criterion_group, criterion_main, Criterion};

use tandem_db::catalog::FINANCIAL;
use tandem_db::transaction::TransactionCoordinator;
use tandem_db::workload::{seed_account, seed_user, transfer};
use tandem_db::{Config, Row};

fn seeded_coordinator() -> TransactionCoordinator {
    let coordinator =
        TransactionCoordinator::new(Config::default()).expect("bootstrap schema must install");
    coordinator
        .run(|tx| {
            seed_user(tx, 1, "ada", "ada@example.com")?;
            seed_user(tx, 2, "grace", "grace@example.com")?;
            seed_account(tx, 1, 1, "checking", 1_000_000.0)?;
            seed_account(tx, 2, 2, "checking", 1_000_000.0)?;
            Ok(())
        })
        .expect("seeding must commit");
    coordinator
}

fn bench_transaction_lifecycle(c: &mut Criterion) {
    let coordinator = seeded_coordinator();

    c.bench_function("begin_commit_empty", |b| {
        b.iter(|| {
            let tx = coordinator.begin();
            let id = tx.id();
            tx.commit().unwrap();
            black_box(id);
        });
    });
}

fn bench_read_path(c: &mut Criterion) {
    let coordinator = seeded_coordinator();

    c.bench_function("read_committed_row", |b| {
        b.iter(|| {
            let tx = coordinator.begin();
            let row = tx.read(FINANCIAL, "accounts", 1i64).unwrap();
            black_box(&row);
            tx.abort();
        });
    });
}

fn bench_write_path(c: &mut Criterion) {
    let coordinator = seeded_coordinator();

    c.bench_function("update_single_row", |b| {
        b.iter(|| {
            coordinator
                .run(|tx| {
                    tx.update(
                        FINANCIAL,
                        "accounts",
                        Row::new()
                            .with("id", 1i64)
                            .with("user_id", 1i64)
                            .with("type", "checking")
                            .with("balance", 42.0),
                    )
                })
                .unwrap();
        });
    });
}

fn bench_transfer_workload(c: &mut Criterion) {
    let coordinator = seeded_coordinator();
    let ledger_ids = AtomicI64::new(1_000);

    c.bench_function("transfer_between_accounts", |b| {
        b.iter(|| {
            let ledger_id = ledger_ids.fetch_add(1, Ordering::Relaxed);
            coordinator
                .run(transfer(1, 2, 0.0, ledger_id))
                .unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_transaction_lifecycle,
    bench_read_path,
    bench_write_path,
    bench_transfer_workload
);
criterion_main!(benches);
