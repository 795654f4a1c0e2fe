use criterion::{criterion_group, criterion_main, Criterion};
use peercam::signaling::policy::{check_viewing, Target, Viewer};
use peercam::signaling::{
    Command, Input, LocalCamera, RelayMessage, Relationship, Signaling, SignalingConfig, VideoFlags, WhoEntry,
};
use std::hint::black_box;
use std::time::Instant;

fn bench_check_viewing(c: &mut Criterion) {
    let camera = LocalCamera {
        active: true,
        ..Default::default()
    };
    let viewer = Viewer {
        camera: &camera,
        vip: false,
        no_video: false,
    };
    let targets: Vec<Target> = (0..256u32)
        .map(|bits| Target {
            flags: VideoFlags::from_bits(bits),
            vip: bits % 3 == 0,
        })
        .collect();
    let rel = Relationship::default();

    c.bench_function("check_viewing_all_flag_sets", |b| {
        b.iter(|| {
            let allowed = targets
                .iter()
                .filter(|t| check_viewing(viewer, **t, &rel).is_ok())
                .count();
            black_box(allowed)
        })
    });
}

fn who_list(count: usize, active: bool) -> RelayMessage {
    RelayMessage::Who {
        who_list: (0..count)
            .map(|i| WhoEntry {
                username: format!("user{}", i),
                status: "online".to_string(),
                video: VideoFlags {
                    active,
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect(),
    }
}

fn bench_who_reconcile(c: &mut Criterion) {
    let now = Instant::now();
    let mut sig = Signaling::new(SignalingConfig {
        username: "alice".to_string(),
        ..Default::default()
    });
    sig.handle_input(now, Input::RelayConnected);
    sig.handle_input(now, Input::Relay(who_list(200, true)));
    for i in 0..50 {
        sig.handle_input(now, Input::Command(Command::OpenVideo { username: format!("user{}", i) }));
    }
    while sig.poll_output().is_some() {}

    let active = who_list(200, true);
    c.bench_function("who_reconcile_200_peers", |b| {
        b.iter(|| {
            sig.handle_input(now, Input::Relay(active.clone()));
            while let Some(output) = sig.poll_output() {
                black_box(output);
            }
        })
    });
}

criterion_group!(benches, bench_check_viewing, bench_who_reconcile);
criterion_main!(benches);
