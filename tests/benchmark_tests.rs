//! Performance benchmarks for the admission hot path

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use turnstile::antispam::AntiSpamDetector;
use turnstile::checks::CheckPipeline;
use turnstile::config::{AntiSpamConfig, PolicyConfig};
use turnstile::counters::{AccountLimitCounter, RateLimitCounter};
use turnstile::geo::NoGeoData;
use turnstile::queue::ServerQueue;
use turnstile_shared::ConnectingUser;
use uuid::Uuid;

fn full_config() -> PolicyConfig {
    PolicyConfig::from_json(
        r#"{
            "nickname-block": { "block-containing": ["admin", "moderator", "owner", "staff"] },
            "account-limit": { "per-ip-limit": 3 },
            "asn-block": { "list": ["AS1", "AS2", "AS3"] },
            "geoip": { "blacklist-mode": true, "countries": ["XX", "YY"] },
            "rate-limit": { "connections-per-second": 1000000 }
        }"#,
    )
    .unwrap()
}

/// Benchmarks a full pipeline run for a player no check objects to
#[test]
fn benchmark_pipeline_evaluation() {
    let pipeline = CheckPipeline::from_config(
        &full_config(),
        Arc::new(AccountLimitCounter::new()),
        Arc::new(RateLimitCounter::new()),
        Arc::new(NoGeoData::new()),
    );
    let user = ConnectingUser::new("RegularPlayer", "10.0.0.1".parse().unwrap());

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        assert!(pipeline.evaluate(&user).is_none());
    }

    let duration = start.elapsed();
    println!(
        "Pipeline evaluation: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds even unoptimized
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks account counter updates spread over many addresses
#[test]
fn benchmark_account_counter() {
    let counter = AccountLimitCounter::new();
    let addresses: Vec<IpAddr> = (0..1000u32)
        .map(|i| IpAddr::from(std::net::Ipv4Addr::from(0x0a00_0000 + i)))
        .collect();

    let iterations = 100;
    let start = Instant::now();

    for _ in 0..iterations {
        for address in &addresses {
            counter.increment(*address);
        }
        for address in &addresses {
            counter.decrement(*address);
        }
    }

    let duration = start.elapsed();
    println!(
        "Account counter: {} updates in {:?}",
        iterations * addresses.len() * 2,
        duration
    );

    assert_eq!(counter.tracked_addresses(), 0);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks chat observation with a full retention window
#[test]
fn benchmark_antispam_observe() {
    let detector = AntiSpamDetector::with_retention(Duration::from_secs(3600));
    let config = AntiSpamConfig {
        enabled: true,
        chat_threshold: 500,
    };
    let player = Uuid::new_v4();

    let iterations = 2_000;
    let start = Instant::now();

    for i in 0..iterations {
        detector.observe(&config, player, &format!("message number {}", i));
    }

    let duration = start.elapsed();
    println!(
        "Anti-spam: {} messages in {:?} ({:.2} μs/msg)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(detector.len(), iterations);
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks queue churn: players joining and switching destinations
#[test]
fn benchmark_queue_churn() {
    let queue = ServerQueue::new();
    let players: Vec<Uuid> = (0..500).map(|_| Uuid::new_v4()).collect();
    let destinations = ["survival", "creative", "skyblock"];

    let start = Instant::now();

    for (i, player) in players.iter().enumerate() {
        queue.enqueue(destinations[i % destinations.len()], *player);
    }
    for (i, player) in players.iter().enumerate() {
        queue.attempt(destinations[(i + 1) % destinations.len()], *player);
    }

    let duration = start.elapsed();
    println!("Queue churn: {} players in {:?}", players.len(), duration);

    let total: usize = destinations.iter().map(|d| queue.len(d)).sum();
    assert_eq!(total, players.len());
    assert!(duration.as_millis() < 2000);
}
