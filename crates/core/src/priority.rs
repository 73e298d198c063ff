//! Salience scoring.
//!
//! Every memory carries a `current_priority` in `[0, 1]` recomputed at
//! creation and on each access. The score is a type-weighted blend of
//! recency, stated importance, usage, and emotional intensity, so identity
//! and belief memories stay salient through importance while episodic ones
//! ride on recency.

use chrono::{DateTime, Utc};

use crate::model::{Memory, MemoryType, Stability};

/// Recency half-life in days: a memory untouched for 30 days scores 0.5.
const HALF_LIFE_DAYS: f64 = 30.0;

/// Usage saturates at 100 accesses (log(101) normalization).
const USAGE_SATURATION: f64 = 100.0;

/// Canonical self/belief memories never drop below this.
const CANONICAL_FLOOR: f64 = 0.4;

/// Blend weights per memory type: (recency, importance, usage, emotion).
fn weights(memory_type: MemoryType) -> (f64, f64, f64, f64) {
    match memory_type {
        MemoryType::Identity | MemoryType::Belief => (0.10, 0.40, 0.30, 0.20),
        MemoryType::Pattern => (0.25, 0.30, 0.30, 0.15),
        MemoryType::Episodic => (0.40, 0.20, 0.20, 0.20),
        MemoryType::Semantic => (0.10, 0.50, 0.20, 0.20),
    }
}

/// Compute `current_priority` for `memory` at `now`.
///
/// The recency reference is the last access when known, else creation time,
/// else the content timestamp. Each component is clamped to `[0, 1]` before
/// blending, and the blend is clamped again so rounding can never escape the
/// interval.
pub fn compute_priority(memory: &Memory, now: DateTime<Utc>) -> f64 {
    let reference = memory
        .dynamics
        .last_accessed_at
        .unwrap_or(memory.dynamics.created_at);
    let reference = if reference > now && memory.content.timestamp <= now {
        // A clock-skewed reference would yield negative age; fall back to
        // the content timestamp when it is sane.
        memory.content.timestamp
    } else {
        reference
    };

    let recency = recency_score(now, reference);
    let importance = memory.importance.score();
    let usage = usage_score(memory.dynamics.access_count);
    let emotion = memory
        .emotion
        .as_ref()
        .and_then(|e| e.intensity)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);

    let (w_recency, w_importance, w_usage, w_emotion) = weights(memory.memory_type);
    let blended = w_recency * recency
        + w_importance * importance
        + w_usage * usage
        + w_emotion * emotion;

    let floored = if memory.dynamics.stability == Stability::Canonical
        && matches!(memory.memory_type, MemoryType::Identity | MemoryType::Belief)
    {
        blended.max(CANONICAL_FLOOR)
    } else {
        blended
    };

    floored.clamp(0.0, 1.0)
}

/// Exponential decay over age: `2^(-age_days / 30)`, clamped to `[0, 1]`.
fn recency_score(now: DateTime<Utc>, reference: DateTime<Utc>) -> f64 {
    let age_days = (now - reference).num_seconds().max(0) as f64 / 86_400.0;
    (2.0_f64).powf(-age_days / HALF_LIFE_DAYS).clamp(0.0, 1.0)
}

/// Logarithmic usage: 0 accesses → 0.0, 100 accesses → 1.0.
fn usage_score(access_count: i64) -> f64 {
    if access_count <= 0 {
        return 0.0;
    }
    let count = access_count as f64;
    if !count.is_finite() {
        return 0.0;
    }
    ((1.0 + count).ln() / (1.0 + USAGE_SATURATION).ln()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::model::{
        Dynamics, Emotion, Importance, Memory, MemoryContent, MemoryKind, MemoryType, Stability,
    };

    fn memory(memory_type: MemoryType, age_days: i64, access_count: i64) -> Memory {
        let now = Utc::now();
        let created = now - Duration::days(age_days);
        Memory {
            id: "mem_test".to_string(),
            index_name: "default".to_string(),
            content: MemoryContent { text: "t".to_string(), timestamp: created },
            embedding: None,
            memory_type,
            kind: MemoryKind::Raw,
            importance: Importance::Low,
            tags: vec![],
            topic: None,
            source: None,
            source_path: None,
            channel: None,
            emotion: None,
            dynamics: Dynamics {
                initial_priority: 0.5,
                current_priority: 0.5,
                created_at: created,
                last_accessed_at: None,
                access_count,
                max_access_count: access_count,
                stability: Stability::Tentative,
                sleep_cycles: 0,
            },
            derived_from_ids: vec![],
            superseded_by_id: None,
            metadata: serde_json::Value::Null,
            relationships: vec![],
        }
    }

    #[test]
    fn month_old_episodic_low_importance_scores_point_26() {
        // recency = 2^(-30/30) = 0.5, importance = 0.3, usage = 0, emotion = 0
        // 0.4*0.5 + 0.2*0.3 = 0.26
        let m = memory(MemoryType::Episodic, 30, 0);
        let score = compute_priority(&m, Utc::now());
        assert!((score - 0.26).abs() < 1e-3, "got {score}");
    }

    #[test]
    fn canonical_belief_gets_the_floor() {
        let mut m = memory(MemoryType::Belief, 365, 0);
        m.importance = Importance::High;
        m.dynamics.stability = Stability::Canonical;
        let score = compute_priority(&m, Utc::now());
        assert!(score >= 0.4, "got {score}");
    }

    #[test]
    fn canonical_floor_only_applies_to_self_and_belief() {
        let mut m = memory(MemoryType::Episodic, 3650, 0);
        m.dynamics.stability = Stability::Canonical;
        let score = compute_priority(&m, Utc::now());
        assert!(score < 0.4, "episodic must decay below the floor, got {score}");
    }

    #[test]
    fn priority_is_monotonically_non_increasing_in_age() {
        let now = Utc::now();
        let mut previous = f64::INFINITY;
        for age in [0, 1, 7, 30, 90, 365, 3650] {
            let m = memory(MemoryType::Episodic, age, 0);
            let score = compute_priority(&m, now);
            assert!(score <= previous + 1e-9, "age {age}: {score} > {previous}");
            previous = score;
        }
    }

    #[test]
    fn score_always_in_unit_interval() {
        let now = Utc::now();
        for ty in [
            MemoryType::Identity,
            MemoryType::Belief,
            MemoryType::Pattern,
            MemoryType::Episodic,
            MemoryType::Semantic,
        ] {
            for age in [0, 400] {
                for count in [0, 5, 10_000] {
                    let mut m = memory(ty, age, count);
                    m.importance = Importance::High;
                    m.emotion = Some(Emotion { label: None, intensity: Some(1.0) });
                    let score = compute_priority(&m, now);
                    assert!((0.0..=1.0).contains(&score), "{ty:?}/{age}/{count}: {score}");
                }
            }
        }
    }

    #[test]
    fn last_access_beats_creation_for_recency() {
        let now = Utc::now();
        let mut m = memory(MemoryType::Episodic, 90, 1);
        let stale = compute_priority(&m, now);
        m.dynamics.last_accessed_at = Some(now - Duration::days(1));
        let fresh = compute_priority(&m, now);
        assert!(fresh > stale);
    }

    #[test]
    fn negative_access_count_treated_as_zero() {
        let mut m = memory(MemoryType::Semantic, 1, 0);
        m.dynamics.access_count = -5;
        let baseline = compute_priority(&memory(MemoryType::Semantic, 1, 0), Utc::now());
        let score = compute_priority(&m, Utc::now());
        assert!((score - baseline).abs() < 1e-9);
    }

    #[test]
    fn future_reference_does_not_exceed_one() {
        let now = Utc::now();
        let mut m = memory(MemoryType::Episodic, 0, 0);
        m.dynamics.created_at = now + Duration::days(3);
        m.content.timestamp = now - Duration::days(1);
        let score = compute_priority(&m, now);
        assert!((0.0..=1.0).contains(&score));
    }
}
