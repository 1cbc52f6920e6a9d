use std::time::Duration;

use switchyard_pool::{
    Candidate, ConfigSnapshot, FailureKind, HealthEngine, Outcome, SelectError,
    TransportErrorKind, select_candidates,
};

fn snapshot(settings: &str) -> ConfigSnapshot {
    let text = format!(
        r#"
providers:
  - name: a
    type: anthropic
    base_url: http://a.local
    auth_type: api_key
    auth_value: ka
  - name: b
    type: openai
    base_url: http://b.local
    auth_type: api_key
    auth_value: kb
  - name: c
    type: openai
    base_url: http://c.local
    auth_type: api_key
    auth_value: kc
    enabled: false
model_routes:
  "claude-3-5-sonnet-*":
    - provider: a
      model: passthrough
      priority: 1
    - provider: b
      model: gpt-4o
      priority: 2
  "*haiku*":
    - provider: b
      model: gpt-4o-mini
      priority: 1
    - provider: a
      model: passthrough
      priority: 1
  "disabled-only":
    - provider: c
settings:
{settings}
"#
    );
    ConfigSnapshot::parse_str(&text).unwrap()
}

fn names(candidates: &[Candidate]) -> Vec<&str> {
    candidates
        .iter()
        .map(|candidate| candidate.provider.name.as_str())
        .collect()
}

fn qualifying() -> Outcome {
    Outcome::Failure(FailureKind::HttpStatus(500))
}

#[test]
fn priority_order_and_passthrough_resolution() {
    let snapshot = snapshot("  {}");
    let engine = HealthEngine::new();
    let candidates =
        select_candidates(&engine, &snapshot, "claude-3-5-sonnet-20241022").unwrap();
    assert_eq!(names(&candidates), ["a", "b"]);
    assert_eq!(candidates[0].upstream_model, "claude-3-5-sonnet-20241022");
    assert_eq!(candidates[1].upstream_model, "gpt-4o");
}

#[test]
fn no_route_and_all_unhealthy_are_distinguished() {
    let snapshot = snapshot("  {}");
    let engine = HealthEngine::new();
    assert_eq!(
        select_candidates(&engine, &snapshot, "gemini-pro").unwrap_err(),
        SelectError::NoRoute
    );
    assert_eq!(
        select_candidates(&engine, &snapshot, "disabled-only").unwrap_err(),
        SelectError::AllUnhealthy
    );
}

#[test]
fn threshold_marks_unhealthy_and_cooldown_recovers() {
    let snapshot = snapshot("  unhealthy_threshold: 2\n  failure_cooldown: 0\n");
    let settings = &snapshot.settings;
    let engine = HealthEngine::new();
    let provider_a = snapshot.provider("a").unwrap();

    assert!(!engine.record_outcome("a", qualifying(), settings));
    assert_eq!(engine.error_count("a"), 1);
    assert!(engine.is_selectable(provider_a, settings));

    // Second qualifying failure crosses the threshold.
    assert!(engine.record_outcome("a", qualifying(), settings));
    assert_eq!(engine.error_count("a"), 2);

    // Zero cooldown for the test: selectability is recomputed lazily.
    assert!(engine.is_selectable(provider_a, settings));
}

#[test]
fn cooldown_window_blocks_selection() {
    let snapshot = snapshot("  unhealthy_threshold: 1\n  failure_cooldown: 3600\n");
    let settings = &snapshot.settings;
    let engine = HealthEngine::new();
    let provider_a = snapshot.provider("a").unwrap();

    assert!(engine.record_outcome("a", qualifying(), settings));
    assert!(!engine.is_selectable(provider_a, settings));

    let candidates =
        select_candidates(&engine, &snapshot, "claude-3-5-sonnet-20241022").unwrap();
    assert_eq!(names(&candidates), ["b"]);
}

#[test]
fn success_resets_counter_and_unhealthy_flag() {
    let snapshot = snapshot("  unhealthy_threshold: 1\n  failure_cooldown: 3600\n");
    let settings = &snapshot.settings;
    let engine = HealthEngine::new();
    let provider_a = snapshot.provider("a").unwrap();

    engine.record_outcome("a", qualifying(), settings);
    assert!(!engine.is_selectable(provider_a, settings));

    engine.record_outcome("a", Outcome::Success, settings);
    assert_eq!(engine.error_count("a"), 0);
    assert!(engine.is_selectable(provider_a, settings));
}

#[test]
fn non_qualifying_failures_do_not_count() {
    let snapshot = snapshot("  unhealthy_threshold: 1\n");
    let settings = &snapshot.settings;
    let engine = HealthEngine::new();

    let surface = Outcome::Failure(FailureKind::Transport(TransportErrorKind::Other));
    assert!(!engine.record_outcome("a", surface, settings));
    assert_eq!(engine.error_count("a"), 0);
    assert!(engine.is_selectable(snapshot.provider("a").unwrap(), settings));
}

#[test]
fn sticky_provider_is_promoted_within_window() {
    let snapshot = snapshot("  sticky_provider_duration: 3600\n");
    let settings = &snapshot.settings;
    let engine = HealthEngine::new();

    engine.record_outcome("b", Outcome::Success, settings);
    let candidates =
        select_candidates(&engine, &snapshot, "claude-3-5-sonnet-20241022").unwrap();
    assert_eq!(names(&candidates), ["b", "a"]);
}

#[test]
fn expired_sticky_has_no_effect() {
    let snapshot = snapshot("  sticky_provider_duration: 0\n");
    let settings = &snapshot.settings;
    let engine = HealthEngine::new();

    engine.record_outcome("b", Outcome::Success, settings);
    std::thread::sleep(Duration::from_millis(5));
    let candidates =
        select_candidates(&engine, &snapshot, "claude-3-5-sonnet-20241022").unwrap();
    assert_eq!(names(&candidates), ["a", "b"]);
}

#[test]
fn round_robin_rotates_top_priority_band() {
    let snapshot = snapshot("  selection_strategy: round_robin\n");
    let engine = HealthEngine::new();

    let first = select_candidates(&engine, &snapshot, "claude-3-5-haiku-20241022").unwrap();
    let second = select_candidates(&engine, &snapshot, "claude-3-5-haiku-20241022").unwrap();
    let third = select_candidates(&engine, &snapshot, "claude-3-5-haiku-20241022").unwrap();
    assert_eq!(names(&first), ["b", "a"]);
    assert_eq!(names(&second), ["a", "b"]);
    assert_eq!(names(&third), ["b", "a"]);
}

#[test]
fn random_strategy_keeps_band_membership() {
    let snapshot = snapshot("  selection_strategy: random\n");
    let engine = HealthEngine::new();

    for _ in 0..10 {
        let candidates =
            select_candidates(&engine, &snapshot, "claude-3-5-haiku-20241022").unwrap();
        let mut sorted = names(&candidates);
        sorted.sort();
        assert_eq!(sorted, ["a", "b"]);
    }
}

#[test]
fn provider_snapshot_reports_health_fields() {
    let snapshot = snapshot("  unhealthy_threshold: 1\n  failure_cooldown: 3600\n");
    let settings = &snapshot.settings;
    let engine = HealthEngine::new();
    let provider_a = snapshot.provider("a").unwrap();

    let healthy = engine.snapshot_for(provider_a);
    assert!(healthy.healthy);
    assert_eq!(healthy.error_count, 0);
    assert!(healthy.unhealthy_since.is_none());

    engine.record_outcome("a", qualifying(), settings);
    let unhealthy = engine.snapshot_for(provider_a);
    assert!(!unhealthy.healthy);
    assert_eq!(unhealthy.error_count, 1);
    assert!(unhealthy.unhealthy_since.is_some());
}
