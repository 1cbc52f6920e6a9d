use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::config::{ConfigSnapshot, Provider, SelectionStrategy};
use crate::health::HealthEngine;

/// One resolved attempt target: the provider plus the model name to send it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: Arc<Provider>,
    pub upstream_model: String,
    pub priority: i32,
}

/// The caller must distinguish these: no route at all is a 404, a route whose
/// candidates are all unhealthy is a 503.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    NoRoute,
    AllUnhealthy,
}

/// Resolve the ordered candidate list for one requested model.
pub fn select_candidates(
    engine: &HealthEngine,
    snapshot: &ConfigSnapshot,
    requested_model: &str,
) -> Result<Vec<Candidate>, SelectError> {
    let settings = &snapshot.settings;
    let route = snapshot
        .find_route(requested_model)
        .ok_or(SelectError::NoRoute)?;

    let mut candidates: Vec<Candidate> = route
        .targets
        .iter()
        .filter_map(|target| {
            let provider = snapshot.provider(&target.provider)?;
            engine
                .is_selectable(provider, settings)
                .then(|| Candidate {
                    provider: provider.clone(),
                    upstream_model: target.model.resolve(requested_model),
                    priority: target.priority,
                })
        })
        .collect();
    if candidates.is_empty() {
        return Err(SelectError::AllUnhealthy);
    }

    candidates.sort_by_key(|candidate| candidate.priority);

    let top_priority = candidates[0].priority;
    let band_len = candidates
        .iter()
        .take_while(|candidate| candidate.priority == top_priority)
        .count();
    match settings.selection_strategy {
        SelectionStrategy::Priority => {}
        SelectionStrategy::RoundRobin => {
            let offset = engine.next_round_robin(&route.pattern) % band_len;
            candidates[..band_len].rotate_left(offset);
        }
        SelectionStrategy::Random => {
            candidates[..band_len].shuffle(&mut rand::rng());
        }
    }

    if let Some(sticky) = engine.sticky_provider(settings)
        && let Some(position) = candidates
            .iter()
            .position(|candidate| candidate.provider.name == sticky)
        && position > 0
    {
        let promoted = candidates.remove(position);
        candidates.insert(0, promoted);
    }

    Ok(candidates)
}
