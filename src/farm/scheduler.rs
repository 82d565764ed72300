//! Chooses a worker slot for each call.

use super::config::SchedulingPolicy;
use crate::worker::WorkerState;
use std::collections::HashMap;

/// Where a call should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Queue on this slot.
    Worker(usize),
    /// Hold in the farm-wide queue until a slot goes idle.
    Wait,
    /// Every slot is permanently shut down.
    Unavailable,
}

pub(crate) struct Scheduler {
    policy: SchedulingPolicy,
    cursor: usize,
    sticky: HashMap<String, usize>,
}

impl Scheduler {
    pub fn new(policy: SchedulingPolicy) -> Self {
        Self {
            policy,
            cursor: 0,
            sticky: HashMap::new(),
        }
    }

    /// Pick a slot given the current state of every slot.
    ///
    /// A keyed call goes wherever its key was first placed, even while that
    /// slot is being replaced. Only a slot that is permanently shut down
    /// loses its keys.
    pub fn place(&mut self, key: Option<&str>, states: &[WorkerState]) -> Placement {
        let Some(key) = key else {
            return match self.policy {
                SchedulingPolicy::RoundRobin => self.round_robin(states),
                SchedulingPolicy::InOrder => in_order(states),
            };
        };

        if let Some(&index) = self.sticky.get(key) {
            if states.get(index).is_some_and(|s| !s.is_shut_down()) {
                return Placement::Worker(index);
            }
        }

        let placement = self.round_robin(states);
        match placement {
            Placement::Worker(index) => {
                self.sticky.insert(key.to_string(), index);
            }
            _ => {
                self.sticky.remove(key);
            }
        }
        placement
    }

    /// Next slot from the cursor that takes work promptly, else any slot that
    /// is still coming back.
    fn round_robin(&mut self, states: &[WorkerState]) -> Placement {
        let n = states.len();
        if n == 0 {
            return Placement::Unavailable;
        }
        let order = (0..n).map(|offset| (self.cursor + offset) % n);

        let chosen = order
            .clone()
            .find(|&i| states[i].accepts_work())
            .or_else(|| order.clone().find(|&i| !states[i].is_shut_down()));

        match chosen {
            Some(index) => {
                self.cursor = (index + 1) % n;
                Placement::Worker(index)
            }
            None => Placement::Unavailable,
        }
    }

    #[cfg(test)]
    fn pinned(&self, key: &str) -> Option<usize> {
        self.sticky.get(key).copied()
    }
}

fn in_order(states: &[WorkerState]) -> Placement {
    if let Some(index) = states.iter().position(|&s| s == WorkerState::Idle) {
        Placement::Worker(index)
    } else if states.iter().any(|s| !s.is_shut_down()) {
        Placement::Wait
    } else {
        Placement::Unavailable
    }
}
