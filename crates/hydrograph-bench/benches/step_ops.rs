//! Criterion micro-benchmarks for residual evaluation and time stepping.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use hydrograph_bench::richards_profile;
use hydrograph_core::{ParameterList, Tag};
use hydrograph_pk::{Bdf1Config, Bdf1Integrator, NonlinearFunction, ProcessKernel, StrongCoupler};
use hydrograph_test_utils::{single_column_store, LinearStorageKernel};

/// Benchmark: one Richards residual on a 200-cell column.
fn bench_richards_residual_200(c: &mut Criterion) {
    let (mut store, mut pk) = richards_profile(200).unwrap();
    let u = pk.state_to_solution(&mut store, &Tag::NEXT).unwrap();
    let mut r = u.zeros_like();

    c.bench_function("richards_residual_200", |b| {
        b.iter(|| {
            pk.fun(&mut store, 0.0, 3600.0, None, &u, &mut r).unwrap();
            black_box(r.norm_inf());
        });
    });
}

/// Benchmark: assemble and factor the Richards preconditioner on 200 cells.
fn bench_richards_precon_200(c: &mut Criterion) {
    let (mut store, mut pk) = richards_profile(200).unwrap();
    let u = pk.state_to_solution(&mut store, &Tag::NEXT).unwrap();
    let mut r = u.zeros_like();
    pk.fun(&mut store, 0.0, 3600.0, None, &u, &mut r).unwrap();

    c.bench_function("richards_precon_200", |b| {
        b.iter(|| pk.update_precon(&mut store, 3600.0, &u, 3600.0).unwrap());
    });
}

/// Benchmark: one BDF1 step of two block-coupled storage kernels on 100
/// cells each.
fn bench_coupled_bdf1_step_2x100(c: &mut Criterion) {
    let kernels: Vec<Box<dyn ProcessKernel>> = vec![
        Box::new(LinearStorageKernel::new("first", "u", 2.0, 1.0, 3.0)),
        Box::new(LinearStorageKernel::new("second", "v", 1.0, 1.0, 1.0)),
    ];
    let plist = ParameterList::from_json("pair", r#"{"preconditioner type": "block coupled"}"#).unwrap();
    let mut coupler = StrongCoupler::new(&plist, kernels).unwrap();
    let mut store = single_column_store(100);
    coupler.setup(&mut store).unwrap();
    store.setup().unwrap();
    coupler.initialize(&mut store).unwrap();
    let mut bdf = Bdf1Integrator::new(Bdf1Config::default());

    c.bench_function("coupled_bdf1_step_2x100", |b| {
        b.iter(|| black_box(bdf.step(&mut coupler, &mut store, 0.0, 0.1).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_richards_residual_200,
    bench_richards_precon_200,
    bench_coupled_bdf1_step_2x100
);
criterion_main!(benches);
