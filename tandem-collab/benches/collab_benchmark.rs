use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use tandem_collab::protocol::{
    ChangeEvent, ChangeKind, ClientEvent, EntityKind, RoomRef, ServerEvent, TaskRef, UserInfo,
};
use tandem_collab::{
    CollabHub, ConnectionRegistry, EditLockManager, Fanout, Outbound, PresenceTracker,
    RoomManager, ServerConfig, StaticTokens,
};
use tokio::time::{Duration, Instant};

/// A room of `peers` distinct users, each with one connection.
fn populated_room(peers: usize, capacity: usize) -> (ConnectionRegistry, RoomManager, Vec<Outbound>) {
    let mut registry = ConnectionRegistry::new(capacity);
    let mut rooms = RoomManager::new();
    let mut receivers = Vec::with_capacity(peers);
    for i in 0..peers {
        let (id, rx) = registry.admit(Instant::now());
        registry
            .bind_identity(id, UserInfo::new(format!("u{i}"), format!("User{i}")))
            .unwrap();
        registry.add_room(&id, "p");
        rooms.join(id, "p");
        receivers.push(rx);
    }
    (registry, rooms, receivers)
}

fn sample_change(i: u64) -> ChangeEvent {
    ChangeEvent::new(EntityKind::Task, ChangeKind::Updated)
        .with_field("id", i)
        .with_field("title", "Write release notes")
        .with_field("sectionId", 3)
}

fn bench_event_encode(c: &mut Criterion) {
    let event = ServerEvent::from_change(sample_change(7));

    c.bench_function("change_event_encode", |b| {
        b.iter(|| black_box(black_box(&event).encode().unwrap()))
    });
}

fn bench_client_event_decode(c: &mut Criterion) {
    let frame = ClientEvent::EditClaimStart(TaskRef::new("p", "7")).encode().unwrap();

    c.bench_function("client_event_decode", |b| {
        b.iter(|| black_box(ClientEvent::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_publish_100_peers(c: &mut Criterion) {
    c.bench_function("publish_100_peers", |b| {
        b.iter(|| {
            let (registry, rooms, receivers) = populated_room(100, 16);
            let fanout = Fanout::new();
            let count = fanout.publish(&registry, &rooms, "p", black_box(sample_change(1)));
            black_box((count, receivers.len()));
        })
    });
}

fn bench_publish_1000_changes_100_peers(c: &mut Criterion) {
    c.bench_function("publish_1000_changes_100_peers", |b| {
        b.iter(|| {
            let (registry, rooms, receivers) = populated_room(100, 1024);
            let fanout = Fanout::new();
            for i in 0..1000u64 {
                fanout.publish(&registry, &rooms, "p", black_box(sample_change(i)));
            }
            black_box(receivers.len());
        })
    });
}

fn bench_presence_recompute_100_peers(c: &mut Criterion) {
    let (registry, rooms, _receivers) = populated_room(100, 16);

    c.bench_function("presence_recompute_100_peers", |b| {
        b.iter(|| {
            let mut tracker = PresenceTracker::new();
            black_box(tracker.recompute(black_box("p"), &rooms, &registry));
        })
    });
}

fn bench_claim_release(c: &mut Criterion) {
    let mut locks = EditLockManager::new(Duration::from_secs(300));
    let alice = UserInfo::new("a", "Alice");
    let now = Instant::now();

    c.bench_function("claim_release", |b| {
        b.iter(|| {
            black_box(locks.request_claim("p", black_box("7"), &alice, now));
            black_box(locks.release_claim("7", "a"));
        })
    });
}

fn bench_hub_join_claim(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("hub_join_claim_10_users", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut auth = StaticTokens::new();
                for i in 0..10 {
                    auth = auth.with_user(format!("t{i}"), UserInfo::new(format!("u{i}"), format!("User{i}")));
                }
                let hub = CollabHub::new(ServerConfig::default(), Arc::new(auth));

                let mut receivers = Vec::new();
                for i in 0..10 {
                    let (conn, rx) = hub.connect().await;
                    hub.handle(conn, ClientEvent::Authenticate { token: format!("t{i}") }).await;
                    hub.handle(conn, ClientEvent::JoinRoom(RoomRef::new("p"))).await;
                    hub.handle(conn, ClientEvent::EditClaimStart(TaskRef::new("p", i.to_string()))).await;
                    receivers.push(rx);
                }
                black_box(hub.stats());
            });
        })
    });
}

criterion_group!(
    benches,
    bench_event_encode,
    bench_client_event_decode,
    bench_publish_100_peers,
    bench_publish_1000_changes_100_peers,
    bench_presence_recompute_100_peers,
    bench_claim_release,
    bench_hub_join_claim,
);
criterion_main!(benches);
