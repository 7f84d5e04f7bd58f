use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use remexec::dispatch::decode;
use remexec::executors::telnet::TelnetCodec;
use remexec::scheduler::{SchedulerSettings, SubmitOptions, TaskScheduler, UnitOutcome};
use serde_json::json;

/// Round trip of a trivial unit: submit, run on the loop, collect the outcome
fn bench_submit_and_collect(c: &mut Criterion) {
    let scheduler = TaskScheduler::start(SchedulerSettings::new("bench", 64)).unwrap();
    let mut group = c.benchmark_group("scheduler_round_trip");

    group.bench_function("unlimited", |b| {
        b.iter(|| {
            let name = scheduler
                .submit(SubmitOptions::default(), |_| async { Ok(json!(1)) })
                .unwrap();
            let outcome = scheduler.result_blocking(black_box(&name)).unwrap();
            assert_eq!(outcome, UnitOutcome::Value(json!(1)));
        });
    });

    group.bench_function("limited", |b| {
        b.iter(|| {
            let name = scheduler
                .submit(SubmitOptions::default().limited(), |_| async {
                    Ok(json!(1))
                })
                .unwrap();
            let outcome = scheduler.result_blocking(black_box(&name)).unwrap();
            assert_eq!(outcome, UnitOutcome::Value(json!(1)));
        });
    });

    group.finish();
    scheduler.stop();
}

/// Fan-out of many gated units behind a small concurrency limit
fn bench_gated_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_fan_out");
    group.sample_size(20);

    for units in [10usize, 100, 500] {
        let scheduler = TaskScheduler::start(SchedulerSettings::new("fan-out", 8)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(units), &units, |b, &units| {
            b.iter(|| {
                let names: Vec<String> = (0..units)
                    .filter_map(|_| {
                        scheduler.submit(SubmitOptions::default().limited(), |_| async {
                            tokio::task::yield_now().await;
                            Ok(json!(null))
                        })
                    })
                    .collect();
                for name in &names {
                    scheduler.result_blocking(name).unwrap();
                }
            });
        });
        scheduler.stop();
    }

    group.finish();
}

fn bench_telnet_codec(c: &mut Criterion) {
    let mut chunk = Vec::new();
    for i in 0..512u32 {
        chunk.extend_from_slice(format!("line {} of device output\r\n", i).as_bytes());
        if i % 64 == 0 {
            chunk.extend_from_slice(&[255, 253, 24]);
        }
    }

    c.bench_function("telnet_codec_decode", |b| {
        b.iter(|| {
            let mut codec = TelnetCodec::new();
            let mut data = Vec::with_capacity(chunk.len());
            let mut replies = Vec::new();
            codec.decode(black_box(&chunk), &mut data, &mut replies);
            data.len()
        });
    });
}

fn bench_body_decode(c: &mut Criterion) {
    let payload = serde_json::to_vec(&json!({
        "id": "bench-1",
        "type": "gather",
        "account": {"username": "admin", "password": "pw"},
        "conn": {"ip": "10.0.0.5", "port": 22, "sysType": "linux", "proto": "ssh"},
        "task": {"cmd": "uname -a", "mto": 30},
        "encoding": "utf-8"
    }))
    .unwrap();

    c.bench_function("dispatch_decode_gather", |b| {
        b.iter(|| decode(black_box(&payload)));
    });
}

criterion_group!(
    benches,
    bench_submit_and_collect,
    bench_gated_fan_out,
    bench_telnet_codec,
    bench_body_decode
);
criterion_main!(benches);
