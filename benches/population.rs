use criterion::black_box;
use criterion::{criterion_group, criterion_main, Criterion};
use pharmsim::*;
use rand::{rngs::StdRng, SeedableRng};

fn oral_two_compartment() -> Ode {
    Ode::new(
        3,
        |fe, re, cov, t| {
            fetch_cov!(cov, t, wt);
            let ka = fe.scalar("ka")?;
            let cl = fe.scalar("cl")? * (wt / 70.0).powf(0.75) * re.eta("eta", 0).exp();
            let v1 = fe.scalar("v1")? * (wt / 70.0) * re.eta("eta", 1).exp();
            let q = fe.scalar("q")?;
            let v2 = fe.scalar("v2")?;
            Ok(Quantities::new()
                .with("ka", ka)
                .with("cl", cl)
                .with("v1", v1)
                .with("q", q)
                .with("v2", v2)
                .with_lag(0, fe.scalar("tlag")?))
        },
        |x, q, _t, rateiv, dx| {
            fetch_quantities!(q, ka, cl, v1, qc, v2);
            dx[0] = -ka * x[0];
            dx[1] = ka * x[0] - (cl + qc) / v1 * x[1] + qc / v2 * x[2] + rateiv[1];
            dx[2] = qc / v1 * x[1] - qc / v2 * x[2];
        },
        |x, q, _t, y| {
            y[0] = x[1] / q[2];
        },
        &["cp"],
    )
    .with_domain(
        ParamDomain::new()
            .positive("ka")
            .positive("cl")
            .positive("v1")
            .positive("q")
            .positive("v2")
            .bounded("tlag", 0.0, 2.0),
    )
    .with_random_effects(RandomEffectsSpec::new().block(
        "eta",
        2,
        Covariance::Fixed(dmatrix![0.09, 0.01; 0.01, 0.04]),
    ))
}

fn fixed() -> FixedEffects {
    FixedEffects::new()
        .with_scalar("ka", 1.2)
        .with_scalar("cl", 5.0)
        .with_scalar("v1", 40.0)
        .with_scalar("q", 2.0)
        .with_scalar("v2", 80.0)
        .with_scalar("tlag", 0.5)
}

fn population(n: usize) -> Population {
    (0..n)
        .map(|i| {
            Subject::builder(format!("{}", i))
                .bolus(0.0, 500.0, 0)
                .repeat(13, 12.0)
                .infusion(36.0, 200.0, 1, 0.5)
                .covariate("wt", 0.0, 55.0 + (i % 40) as f64)
                .build()
                .unwrap()
        })
        .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let times: Vec<f64> = (0..=168).map(|t| t as f64).collect();
    let subject = population(1).into_iter().next().unwrap();
    let simulator = Simulator::new(oral_two_compartment(), fixed()).unwrap();
    c.bench_function("subject", |b| {
        b.iter(|| {
            let mut rng = StdRng::seed_from_u64(1);
            black_box(simulator.simulate_subject(&subject, None, Some(times.as_slice()), &mut rng))
        })
    });

    let steady = Subject::builder("ss")
        .bolus(0.0, 500.0, 0)
        .steady_state(SsMode::Reset, 12.0)
        .covariate("wt", 0.0, 70.0)
        .build()
        .unwrap();
    c.bench_function("steady state", |b| {
        b.iter(|| {
            let mut rng = StdRng::seed_from_u64(1);
            black_box(simulator.simulate_subject(&steady, None, Some(&times[..25]), &mut rng))
        })
    });

    let population = population(100);
    c.bench_function("population of 100", |b| {
        b.iter(|| black_box(simulator.simulate(&population, None, Some(times.as_slice()))))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
