use crate::engine::Engine;
use std::sync::{Arc, OnceLock};

static AUX_ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();

/// Returns the process-wide fallback [`Engine`].
///
/// Used by the reconciliation rule in [`Task`](crate::Task) for tasks that have
/// neither a `target_engine` nor a `default_engine`, and by
/// [`Task::yield_to(None)`](crate::Task::yield_to) when the task has no
/// `current_engine` either. The engine is created, with no duration budget, on
/// first use and lives for the remainder of the process — there is
/// deliberately no way to tear it down, matching `spec.md`'s "lifetime =
/// program lifetime" note.
///
/// This is the one piece of ambient global state in the crate; every other
/// component is threaded through explicitly by value, which is what keeps
/// tests that don't touch the auxiliary engine hermetic.
pub fn aux_engine() -> Arc<Engine> {
    AUX_ENGINE.get_or_init(|| Engine::new("auxiliary")).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_a_singleton() {
        let a = aux_engine();
        let b = aux_engine();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn has_no_duration_budget() {
        assert!(!aux_engine().has_max_duration());
    }
}
