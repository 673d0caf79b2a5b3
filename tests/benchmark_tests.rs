//! Performance benchmarks for the coordination hot paths

use server::arbiter::Arbiter;
use server::config::ElectionConfig;
use server::consensus::{Engine, Input};
use server::failure_detector::HeartbeatStats;
use shared::{validate_frame, Channel, ControlMessage, MatchPreferences, RelayMessage};
use std::time::{Duration, Instant};

/// Benchmarks matchmaking over a full bin table
#[test]
fn benchmark_matchmaking() {
    let mut arbiter = Arbiter::new(10);
    let names: Vec<String> = (0..1000).map(|i| format!("player{}", i)).collect();

    let iterations = 100_000;
    let start = Instant::now();
    let mut matches = 0;

    for i in 0..iterations {
        let preferences = MatchPreferences {
            level: (i % 12) as i64 - 1,
            allow_lower: i % 3 == 0,
        };
        if let server::arbiter::MatchOutcome::Matched { .. } =
            arbiter.request_match(&names[i % names.len()], preferences)
        {
            matches += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Matchmaking: {} requests, {} matches in {:?} ({:.2} ns/request)",
        iterations,
        matches,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(matches > 0);
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks heartbeat recording and phi scoring
#[test]
fn benchmark_phi_scoring() {
    let origin = Instant::now();
    let mut stats = HeartbeatStats::new();

    let iterations = 100_000u64;
    let start = Instant::now();
    let mut total = 0.0;

    for i in 0..iterations {
        let at = origin + Duration::from_millis(i * 100 + (i % 7));
        stats.record(at);
        total += stats.phi(at + Duration::from_millis(120));
    }

    let duration = start.elapsed();
    println!(
        "Phi scoring: {} beats in {:?} ({:.2} ns/beat)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(total.is_finite());
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks frame parsing and validation on both channels
#[test]
fn benchmark_frame_validation() {
    let control = ControlMessage::VoteGrant {
        instance_id: "abcdefgh".to_string(),
        term: 42,
        for_instance_id: "ijklmnop".to_string(),
    }
    .to_frame();
    let relay = RelayMessage::MatchRequest {
        requester: "NimbleOtter42".to_string(),
        preferences: MatchPreferences {
            level: 3,
            allow_lower: true,
        },
    }
    .to_frame();

    let iterations = 50_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let value: serde_json::Value = serde_json::from_str(&control).unwrap();
        assert!(validate_frame(&value, Channel::Control).is_ok());
        assert!(RelayMessage::from_frame(&relay).is_ok());
    }

    let duration = start.elapsed();
    println!(
        "Frame validation: {} pairs in {:?} ({:.2} μs/pair)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks follower handling of leader heartbeats
#[test]
fn benchmark_engine_heartbeats() {
    let mut engine = Engine::new("follower", ElectionConfig::default());
    engine.start();
    let origin = Instant::now();

    let iterations = 100_000u64;
    let start = Instant::now();

    for i in 0..iterations {
        let claim = ControlMessage::LeaderClaim {
            instance_id: "leader".to_string(),
            term: 1,
        };
        engine.handle(
            Input::Control(claim),
            origin + Duration::from_millis(i * 500),
        );
    }

    let duration = start.elapsed();
    println!(
        "Engine heartbeats: {} claims in {:?} ({:.2} ns/claim)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(engine.leader(), Some("leader"));
    assert_eq!(engine.heartbeats().samples(), iterations - 1);
    assert!(duration.as_millis() < 1000);
}
