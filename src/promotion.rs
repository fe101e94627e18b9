//! Moving queued and parked tasks back into the running set.
//!
//! Promotion drains the upload queue before the download queue, FIFO within
//! each, and never exceeds the caps intersected with the per-pass allowance of
//! the current constraint level.

use std::collections::HashSet;

use crate::{
    admission::{AdmissionState, Caps},
    classifier::ResourceClass,
    resource::ConstraintLevel,
    signal::Wake,
    task::{Direction, Mid},
    utils::remaining,
};

/// Upload before download. The order is fixed and must not change.
pub const PROMOTION_ORDER: [Direction; 2] = [Direction::Upload, Direction::Download];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Promotion {
    pub promoted: Vec<(Mid, Direction)>,
    /// Queued tasks found cancelled and dropped.
    pub discarded: Vec<Mid>,
}

impl Promotion {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.discarded.is_empty()
    }
}

pub(crate) fn promote_eligible(
    state: &mut AdmissionState,
    caps: &Caps,
    level: ConstraintLevel,
    cancelled: &HashSet<Mid>,
) -> Promotion {
    let mut outcome = Promotion::default();

    let mut budget = remaining(caps.all, state.total_running());
    if let Some(max) = level.max_tasks() {
        budget = budget.min(max);
    }

    for direction in PROMOTION_ORDER {
        let mut slots = remaining(caps.direction(direction), state.running_count(direction));
        while budget > 0 && slots > 0 {
            let Some((mid, signal)) = state.pop_queued(direction) else {
                break;
            };
            if cancelled.contains(&mid) {
                tracing::info!("Dropping cancelled task {mid} from the {direction} queue");
                let _ = signal.fire(Wake::Released);
                outcome.discarded.push(mid);
                continue;
            }
            state.insert_running(mid, direction);
            if let Err(e) = signal.fire(Wake::Promoted) {
                tracing::debug!("Promotion signal for task {mid}: {e}");
            }
            tracing::info!("Promoted {direction} task {mid} from queue");
            outcome.promoted.push((mid, direction));
            budget -= 1;
            slots -= 1;
        }
    }

    outcome
}

/// Resume tasks parked under `class`, within the current caps.
pub(crate) fn resume_parked(
    state: &mut AdmissionState,
    caps: &Caps,
    class: ResourceClass,
) -> Vec<(Mid, Direction)> {
    let mut resumed = Vec::new();
    let mut all_slots = remaining(caps.all, state.total_running());
    let mut download_slots = remaining(caps.download, state.running_count(Direction::Download));
    let mut upload_slots = remaining(caps.upload, state.running_count(Direction::Upload));

    for (mid, direction) in state.parked_of(class) {
        if all_slots == 0 {
            break;
        }
        let slots = match direction {
            Direction::Download => &mut download_slots,
            Direction::Upload => &mut upload_slots,
        };
        if *slots == 0 {
            continue;
        }
        if state.unpark(mid).is_some() {
            *slots -= 1;
            all_slots -= 1;
            resumed.push((mid, direction));
        }
    }
    resumed
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::admission::{Admission, ForceFlags, MidState};

    fn caps(all: usize, download: usize, upload: usize) -> Caps {
        Caps {
            all: NonZeroUsize::new(all),
            download: NonZeroUsize::new(download),
            upload: NonZeroUsize::new(upload),
        }
    }

    fn submit(state: &mut AdmissionState, caps: &Caps, mid: Mid, d: Direction) -> Admission {
        state.admit(mid, d, caps, ForceFlags::default(), None)
    }

    fn assert_within(state: &AdmissionState, caps: &Caps) {
        if let Some(all) = caps.all {
            assert!(state.total_running() <= all.get());
        }
        for d in [Direction::Download, Direction::Upload] {
            if let Some(cap) = caps.direction(d) {
                assert!(state.running_count(d) <= cap.get());
            }
        }
    }

    #[test]
    fn test_completion_promotes_next_download() {
        let mut state = AdmissionState::new();
        let caps = caps(3, 2, 2);
        for mid in 1..=4 {
            submit(&mut state, &caps, mid, Direction::Download);
            assert_within(&state, &caps);
        }
        state.remove(1);
        let outcome = promote_eligible(&mut state, &caps, ConstraintLevel::Normal, &HashSet::new());
        assert_eq!(outcome.promoted, vec![(3, Direction::Download)]);
        assert_eq!(state.state_of(3), Some(MidState::Running(Direction::Download)));
        assert_eq!(state.state_of(4), Some(MidState::Queued(Direction::Download)));
        assert_within(&state, &caps);

        // Nothing else fits.
        let outcome = promote_eligible(&mut state, &caps, ConstraintLevel::Normal, &HashSet::new());
        assert!(outcome.is_empty());
    }

    #[test]
    fn test_uploads_drain_first() {
        let mut state = AdmissionState::new();
        let caps = caps(2, 0, 0);
        submit(&mut state, &caps, 1, Direction::Download);
        submit(&mut state, &caps, 2, Direction::Download);
        submit(&mut state, &caps, 3, Direction::Download);
        submit(&mut state, &caps, 4, Direction::Upload);
        state.remove(1);
        let outcome = promote_eligible(&mut state, &caps, ConstraintLevel::Normal, &HashSet::new());
        assert_eq!(outcome.promoted, vec![(4, Direction::Upload)]);
        assert_eq!(state.state_of(3), Some(MidState::Queued(Direction::Download)));
    }

    #[test]
    fn test_direction_caps_without_global_cap() {
        let mut state = AdmissionState::new();
        let caps = caps(0, 1, 2);
        for mid in 1..=3 {
            submit(&mut state, &caps, mid, Direction::Download);
        }
        for mid in 10..=13 {
            submit(&mut state, &caps, mid, Direction::Upload);
        }
        state.remove(1);
        state.remove(10);
        let outcome = promote_eligible(&mut state, &caps, ConstraintLevel::Normal, &HashSet::new());
        assert_eq!(
            outcome.promoted,
            vec![(12, Direction::Upload), (2, Direction::Download)]
        );
        assert_within(&state, &caps);
    }

    #[test]
    fn test_constraint_level_limits_each_pass() {
        let mut state = AdmissionState::new();
        let caps = caps(1, 0, 0);
        for mid in 1..=6 {
            submit(&mut state, &caps, mid, Direction::Download);
        }
        state.remove(1);
        let unbounded = Caps::default();
        let outcome = promote_eligible(&mut state, &unbounded, ConstraintLevel::Critical, &HashSet::new());
        assert_eq!(outcome.promoted.len(), 1);
        let outcome = promote_eligible(&mut state, &unbounded, ConstraintLevel::Moderate, &HashSet::new());
        assert_eq!(outcome.promoted.len(), 2);
        let outcome = promote_eligible(&mut state, &unbounded, ConstraintLevel::Normal, &HashSet::new());
        assert_eq!(outcome.promoted.len(), 2);
        assert_eq!(state.queued_count(Direction::Download), 0);
    }

    #[tokio::test]
    async fn test_cancelled_queued_task_is_discarded() {
        let mut state = AdmissionState::new();
        let caps = caps(1, 0, 0);
        submit(&mut state, &caps, 1, Direction::Download);
        let Admission::Queued { wait, .. } = submit(&mut state, &caps, 2, Direction::Download)
        else {
            panic!("should be queued");
        };
        let Admission::Queued { wait: wait3, .. } =
            submit(&mut state, &caps, 3, Direction::Download)
        else {
            panic!("should be queued");
        };
        state.remove(1);

        let cancelled = HashSet::from([2]);
        let outcome = promote_eligible(&mut state, &caps, ConstraintLevel::Normal, &cancelled);
        assert_eq!(outcome.discarded, vec![2]);
        assert_eq!(outcome.promoted, vec![(3, Direction::Download)]);
        assert_eq!(state.state_of(2), None);
        assert_eq!(wait.wait().await, Wake::Released);
        assert_eq!(wait3.wait().await, Wake::Promoted);
    }

    #[test]
    fn test_resume_parked_respects_caps() {
        let mut state = AdmissionState::new();
        let open = Caps::default();
        for mid in 1..=3 {
            submit(&mut state, &open, mid, Direction::Download);
            state.park(mid, ResourceClass::Memory);
        }
        submit(&mut state, &open, 4, Direction::Download);
        state.park(4, ResourceClass::Cpu);
        submit(&mut state, &open, 5, Direction::Download);

        let caps = caps(0, 2, 0);
        let resumed = resume_parked(&mut state, &caps, ResourceClass::Memory);
        assert_eq!(resumed, vec![(1, Direction::Download)]);
        assert_eq!(state.running_count(Direction::Download), 2);
        assert_eq!(
            state.state_of(4),
            Some(MidState::Parked(Direction::Download, ResourceClass::Cpu))
        );
        assert_eq!(state.parked_count(), 3);
    }
}
