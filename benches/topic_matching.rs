//! Benchmarks for subscription matching and inbound dispatch

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

use vibemq_inbound::config::InboundConfig;
use vibemq_inbound::flow::signal_channel;
use vibemq_inbound::protocol::SubscriptionOptions;
use vibemq_inbound::topic::{topic_matches_filter, TopicFilter, TopicTrie};
use vibemq_inbound::{InboundMetrics, InboundSession, Publish, QoS, Subscription};

fn generate_topics(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("device/gear-{:03}/sensor/{}/data", i, i % 10))
        .collect()
}

fn generate_filters(count: usize) -> Vec<String> {
    let mut filters = vec![
        "device/+/sensor/+/data".to_string(),
        "device/#".to_string(),
        "device/+/#".to_string(),
        "logs/#".to_string(),
    ];
    filters.extend((0..count).map(|i| format!("device/gear-{:03}/sensor/+/data", i)));
    filters
}

fn bench_trie_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_match");

    for size in [100, 1000, 10000].iter() {
        let filters = generate_filters(*size);
        let mut trie = TopicTrie::<u32>::new();
        for (i, f) in filters.iter().enumerate() {
            let filter = TopicFilter::parse(f).expect("valid filter");
            trie.subscribe(&filter, SubscriptionOptions::default(), None, Some(i as u32));
            trie.suback(&filter, None, false);
        }

        let mut rng = StdRng::seed_from_u64(7);
        let topics = generate_topics(*size);
        let sample: Vec<&String> = topics.choose_multiple(&mut rng, 100).collect();

        group.bench_with_input(BenchmarkId::new("trie", size), size, |b, _| {
            b.iter(|| {
                let mut hits = 0usize;
                for topic in &sample {
                    trie.find_matching(topic, &mut |_, _| hits += 1);
                }
                black_box(hits)
            });
        });

        group.bench_with_input(BenchmarkId::new("linear", size), size, |b, _| {
            b.iter(|| {
                let mut hits = 0usize;
                for topic in &sample {
                    hits += filters
                        .iter()
                        .filter(|f| topic_matches_filter(topic, f))
                        .count();
                }
                black_box(hits)
            });
        });
    }

    group.finish();
}

fn bench_session_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_dispatch");

    for flows in [1, 10, 100].iter() {
        let (signals, _rx) = signal_channel();
        let metrics = Arc::new(InboundMetrics::new());
        let mut session =
            InboundSession::with_metrics(&InboundConfig::default(), signals, metrics);
        let (outbound, _out_rx) = tokio::sync::mpsc::unbounded_channel();
        session.connect(outbound);

        let mut handles = Vec::new();
        for i in 0..*flows {
            let subs = vec![Subscription::parse(&format!("bench/{}/+", i % 10), QoS::AtLeastOnce)
                .expect("valid filter")];
            let flow = session.subscribe(&subs, None, false);
            session.sub_ack(&subs, None, &[]);
            flow.request_unbounded();
            handles.push(flow);
        }

        group.bench_with_input(BenchmarkId::new("qos0", flows), flows, |b, _| {
            b.iter(|| {
                let publish = Publish::new("bench/3/x", "payload", QoS::AtMostOnce);
                black_box(session.on_publish(publish).is_ok());
                for flow in handles.iter_mut() {
                    while flow.try_next().is_some() {}
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_trie_match, bench_session_dispatch);
criterion_main!(benches);
