//! Running/queued bookkeeping and the admission decision for new submissions.
//!
//! Every `mid` lives in at most one bucket: running, queued (waiting on a
//! [`Signal`]) or parked by the resource monitor. All mutation happens while
//! the scheduler holds its admission lock, so counts read here are exact.

use std::{collections::HashSet, num::NonZeroUsize};

use hashlink::LinkedHashMap;

use crate::{
    classifier::ResourceClass,
    signal::{self, Signal, WaitSignal, Wake},
    task::{Direction, Mid},
};

/// Concurrency caps, `None` meaning unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caps {
    pub all: Option<NonZeroUsize>,
    pub download: Option<NonZeroUsize>,
    pub upload: Option<NonZeroUsize>,
}

impl Caps {
    #[inline]
    pub fn direction(&self, direction: Direction) -> Option<NonZeroUsize> {
        match direction {
            Direction::Download => self.download,
            Direction::Upload => self.upload,
        }
    }

    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.all.is_none() && self.download.is_none() && self.upload.is_none()
    }
}

/// Per-submission overrides that skip the caps. They never skip the
/// resource force-queue check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForceFlags {
    pub run: bool,
    pub download: bool,
    pub upload: bool,
}

impl ForceFlags {
    #[inline]
    pub fn bypasses(&self, direction: Direction) -> bool {
        self.run
            || match direction {
                Direction::Download => self.download,
                Direction::Upload => self.upload,
            }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidState {
    Running(Direction),
    Queued(Direction),
    /// Demoted by the resource monitor; resumed only by it.
    Parked(Direction, ResourceClass),
}

impl MidState {
    pub fn direction(&self) -> Direction {
        match *self {
            MidState::Running(d) | MidState::Queued(d) | MidState::Parked(d, _) => d,
        }
    }
}

/// Outcome of an admission request.
#[derive(Debug)]
pub enum Admission {
    Running,
    Queued {
        wait: WaitSignal,
        /// Set when the host was near saturation rather than the caps being full.
        reason: Option<String>,
    },
}

impl Admission {
    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self, Admission::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Parked {
    pub direction: Direction,
    pub class: ResourceClass,
}

#[derive(Debug, Default)]
pub struct AdmissionState {
    running_download: HashSet<Mid>,
    running_upload: HashSet<Mid>,
    // Insertion order is promotion order.
    queued_download: LinkedHashMap<Mid, Signal>,
    queued_upload: LinkedHashMap<Mid, Signal>,
    parked: LinkedHashMap<Mid, Parked>,
}

impl AdmissionState {
    pub fn new() -> Self {
        Self::default()
    }

    fn running_set(&self, direction: Direction) -> &HashSet<Mid> {
        match direction {
            Direction::Download => &self.running_download,
            Direction::Upload => &self.running_upload,
        }
    }

    fn running_set_mut(&mut self, direction: Direction) -> &mut HashSet<Mid> {
        match direction {
            Direction::Download => &mut self.running_download,
            Direction::Upload => &mut self.running_upload,
        }
    }

    fn queue(&self, direction: Direction) -> &LinkedHashMap<Mid, Signal> {
        match direction {
            Direction::Download => &self.queued_download,
            Direction::Upload => &self.queued_upload,
        }
    }

    fn queue_mut(&mut self, direction: Direction) -> &mut LinkedHashMap<Mid, Signal> {
        match direction {
            Direction::Download => &mut self.queued_download,
            Direction::Upload => &mut self.queued_upload,
        }
    }

    #[inline]
    pub fn running_count(&self, direction: Direction) -> usize {
        self.running_set(direction).len()
    }

    #[inline]
    pub fn total_running(&self) -> usize {
        self.running_download.len() + self.running_upload.len()
    }

    #[inline]
    pub fn queued_count(&self, direction: Direction) -> usize {
        self.queue(direction).len()
    }

    #[inline]
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Queued mids of one direction in promotion order.
    pub fn queued_mids(&self, direction: Direction) -> Vec<Mid> {
        self.queue(direction).keys().copied().collect()
    }

    pub fn state_of(&self, mid: Mid) -> Option<MidState> {
        for direction in [Direction::Download, Direction::Upload] {
            if self.running_set(direction).contains(&mid) {
                return Some(MidState::Running(direction));
            }
            if self.queue(direction).contains_key(&mid) {
                return Some(MidState::Queued(direction));
            }
        }
        self.parked
            .get(&mid)
            .map(|p| MidState::Parked(p.direction, p.class))
    }

    /// Waiting in an admission queue (not parked by the monitor).
    #[inline]
    pub fn is_globally_queued(&self, mid: Mid) -> bool {
        self.queued_download.contains_key(&mid) || self.queued_upload.contains_key(&mid)
    }

    /// Whether one more `direction` task would break a cap.
    pub fn is_over_limit(&self, caps: &Caps, direction: Direction) -> bool {
        let direction_count = self.running_count(direction);
        let all_full = caps
            .all
            .is_some_and(|all| self.total_running() >= all.get());
        let direction_full = caps
            .direction(direction)
            .is_some_and(|cap| direction_count >= cap.get());
        all_full || direction_full
    }

    pub(crate) fn admit(
        &mut self,
        mid: Mid,
        direction: Direction,
        caps: &Caps,
        force: ForceFlags,
        force_queue_reason: Option<String>,
    ) -> Admission {
        match self.state_of(mid) {
            Some(MidState::Running(current)) if current == direction => {
                return Admission::Running;
            }
            // Hand-off between directions, or a resubmission: drop the old entry.
            Some(_) => {
                self.remove(mid);
            }
            None => (),
        }

        if let Some(reason) = force_queue_reason {
            let wait = self.enqueue(mid, direction);
            return Admission::Queued {
                wait,
                reason: Some(reason),
            };
        }

        if !force.bypasses(direction) && self.is_over_limit(caps, direction) {
            let wait = self.enqueue(mid, direction);
            return Admission::Queued { wait, reason: None };
        }

        self.running_set_mut(direction).insert(mid);
        Admission::Running
    }

    fn enqueue(&mut self, mid: Mid, direction: Direction) -> WaitSignal {
        let (signal, wait) = signal::channel();
        self.queue_mut(direction).insert(mid, signal);
        wait
    }

    /// Drop `mid` from every bucket. A queued waiter is woken as released.
    pub(crate) fn remove(&mut self, mid: Mid) -> Option<MidState> {
        let state = self.state_of(mid)?;
        match state {
            MidState::Running(direction) => {
                self.running_set_mut(direction).remove(&mid);
            }
            MidState::Queued(direction) => {
                if let Some(signal) = self.queue_mut(direction).remove(&mid) {
                    let _ = signal.fire(Wake::Released);
                }
            }
            MidState::Parked(..) => {
                self.parked.remove(&mid);
            }
        }
        Some(state)
    }

    /// Free the download slot of a running task ahead of its upload phase.
    pub(crate) fn vacate_download(&mut self, mid: Mid) -> bool {
        self.running_download.remove(&mid)
    }

    pub(crate) fn pop_queued(&mut self, direction: Direction) -> Option<(Mid, Signal)> {
        self.queue_mut(direction).pop_front()
    }

    pub(crate) fn insert_running(&mut self, mid: Mid, direction: Direction) {
        self.running_set_mut(direction).insert(mid);
    }

    /// Move a running task to the monitor's parking area.
    pub(crate) fn park(&mut self, mid: Mid, class: ResourceClass) -> Option<Direction> {
        let direction = match self.state_of(mid)? {
            MidState::Running(direction) => direction,
            _ => return None,
        };
        self.running_set_mut(direction).remove(&mid);
        self.parked.insert(mid, Parked { direction, class });
        Some(direction)
    }

    pub(crate) fn parked_of(&self, class: ResourceClass) -> Vec<(Mid, Direction)> {
        self.parked
            .iter()
            .filter(|(_, p)| p.class == class)
            .map(|(&mid, p)| (mid, p.direction))
            .collect()
    }

    pub(crate) fn unpark(&mut self, mid: Mid) -> Option<Direction> {
        let parked = self.parked.remove(&mid)?;
        self.running_set_mut(parked.direction).insert(mid);
        Some(parked.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(all: usize, download: usize, upload: usize) -> Caps {
        Caps {
            all: NonZeroUsize::new(all),
            download: NonZeroUsize::new(download),
            upload: NonZeroUsize::new(upload),
        }
    }

    fn admit(state: &mut AdmissionState, caps: &Caps, mid: Mid, d: Direction) -> Admission {
        state.admit(mid, d, caps, ForceFlags::default(), None)
    }

    #[test]
    fn test_unbounded_admits_everything() {
        let mut state = AdmissionState::new();
        let caps = Caps::default();
        assert!(caps.is_unbounded());
        for mid in 0..50 {
            assert!(admit(&mut state, &caps, mid, Direction::Download).is_running());
        }
        assert_eq!(state.running_count(Direction::Download), 50);
    }

    #[test]
    fn test_direction_cap() {
        let mut state = AdmissionState::new();
        let caps = caps(3, 2, 2);
        assert!(admit(&mut state, &caps, 1, Direction::Download).is_running());
        assert!(admit(&mut state, &caps, 2, Direction::Download).is_running());
        assert!(!admit(&mut state, &caps, 3, Direction::Download).is_running());
        assert!(!admit(&mut state, &caps, 4, Direction::Download).is_running());
        assert_eq!(state.queued_mids(Direction::Download), vec![3, 4]);
        assert_eq!(state.state_of(3), Some(MidState::Queued(Direction::Download)));
        assert!(state.is_globally_queued(4));

        // Uploads have their own cap, but the global cap still binds.
        assert!(admit(&mut state, &caps, 5, Direction::Upload).is_running());
        assert!(!admit(&mut state, &caps, 6, Direction::Upload).is_running());
        assert_eq!(state.total_running(), 3);
    }

    #[test]
    fn test_global_cap_is_a_ceiling() {
        let mut state = AdmissionState::new();
        let caps = caps(2, 0, 0);
        assert!(admit(&mut state, &caps, 1, Direction::Download).is_running());
        assert!(admit(&mut state, &caps, 2, Direction::Upload).is_running());
        assert!(!admit(&mut state, &caps, 3, Direction::Download).is_running());
        assert!(!admit(&mut state, &caps, 4, Direction::Upload).is_running());
    }

    #[test]
    fn test_force_flags_bypass_caps() {
        let mut state = AdmissionState::new();
        let caps = caps(1, 1, 1);
        assert!(admit(&mut state, &caps, 1, Direction::Download).is_running());

        let force_dl = ForceFlags {
            download: true,
            ..Default::default()
        };
        assert!(state
            .admit(2, Direction::Download, &caps, force_dl, None)
            .is_running());
        // Download override does not cover uploads.
        assert!(!state
            .admit(3, Direction::Upload, &caps, force_dl, None)
            .is_running());

        let force_run = ForceFlags {
            run: true,
            ..Default::default()
        };
        assert!(state
            .admit(4, Direction::Upload, &caps, force_run, None)
            .is_running());
    }

    #[test]
    fn test_force_queue_reason_wins_over_free_slots_and_flags() {
        let mut state = AdmissionState::new();
        let caps = Caps::default();
        let force = ForceFlags {
            run: true,
            ..Default::default()
        };
        let admission = state.admit(
            1,
            Direction::Download,
            &caps,
            force,
            Some("critical resources".to_string()),
        );
        match admission {
            Admission::Queued { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("critical resources"))
            }
            Admission::Running => panic!("should be queued"),
        }
        assert_eq!(state.state_of(1), Some(MidState::Queued(Direction::Download)));
    }

    #[test]
    fn test_hand_off_to_upload_vacates_download() {
        let mut state = AdmissionState::new();
        let caps = caps(0, 1, 1);
        assert!(admit(&mut state, &caps, 1, Direction::Download).is_running());
        assert!(admit(&mut state, &caps, 1, Direction::Upload).is_running());
        assert_eq!(state.state_of(1), Some(MidState::Running(Direction::Upload)));
        assert_eq!(state.running_count(Direction::Download), 0);
        // Re-admitting in the same direction is a no-op.
        assert!(admit(&mut state, &caps, 1, Direction::Upload).is_running());
        assert_eq!(state.running_count(Direction::Upload), 1);
    }

    #[tokio::test]
    async fn test_remove_releases_waiter() {
        let mut state = AdmissionState::new();
        let caps = caps(1, 0, 0);
        assert!(admit(&mut state, &caps, 1, Direction::Download).is_running());
        let Admission::Queued { wait, .. } = admit(&mut state, &caps, 2, Direction::Download)
        else {
            panic!("should be queued");
        };
        assert_eq!(
            state.remove(2),
            Some(MidState::Queued(Direction::Download))
        );
        assert_eq!(wait.wait().await, Wake::Released);
        assert_eq!(state.remove(2), None);
    }

    #[test]
    fn test_park_and_unpark() {
        let mut state = AdmissionState::new();
        let caps = Caps::default();
        assert!(admit(&mut state, &caps, 1, Direction::Upload).is_running());
        assert_eq!(state.park(1, ResourceClass::Memory), Some(Direction::Upload));
        assert_eq!(
            state.state_of(1),
            Some(MidState::Parked(Direction::Upload, ResourceClass::Memory))
        );
        assert!(!state.is_globally_queued(1));
        assert_eq!(state.total_running(), 0);
        assert!(state.parked_of(ResourceClass::Cpu).is_empty());
        assert_eq!(
            state.parked_of(ResourceClass::Memory),
            vec![(1, Direction::Upload)]
        );
        // Parking something that is not running does nothing.
        assert_eq!(state.park(1, ResourceClass::Cpu), None);

        assert_eq!(state.unpark(1), Some(Direction::Upload));
        assert_eq!(state.state_of(1), Some(MidState::Running(Direction::Upload)));
    }
}
