use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::domain::approval::{ApprovalInstance, InstanceId};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    pub instance_id: InstanceId,
    pub level: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DueTimer {
    pub instance_id: InstanceId,
    pub level: u32,
    pub deadline: DateTime<Utc>,
}

/// Deadline index for open steps, at most one timer per `(instance, level)`.
///
/// Timers are hints: firing one only asks the engine to re-check the step
/// under the instance lock. The index is rebuilt from persisted step
/// deadlines on startup via [`TimeoutScheduler::rehydrate`].
#[derive(Clone, Debug, Default)]
pub struct TimeoutScheduler {
    queue: BTreeSet<(DateTime<Utc>, TimerKey)>,
    deadlines: HashMap<TimerKey, DateTime<Utc>>,
}

impl TimeoutScheduler {
    pub fn schedule(&mut self, instance_id: InstanceId, level: u32, deadline: DateTime<Utc>) {
        let key = TimerKey { instance_id, level };
        if let Some(previous) = self.deadlines.insert(key.clone(), deadline) {
            self.queue.remove(&(previous, key.clone()));
        }
        self.queue.insert((deadline, key));
    }

    pub fn cancel(&mut self, instance_id: &InstanceId, level: u32) -> bool {
        let key = TimerKey { instance_id: instance_id.clone(), level };
        match self.deadlines.remove(&key) {
            Some(deadline) => self.queue.remove(&(deadline, key)),
            None => false,
        }
    }

    /// Removes and returns every timer whose deadline is at or before `now`,
    /// earliest first.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<DueTimer> {
        let mut due = Vec::new();
        while let Some((deadline, _)) = self.queue.first() {
            if *deadline > now {
                break;
            }
            let Some((deadline, key)) = self.queue.pop_first() else {
                break;
            };
            self.deadlines.remove(&key);
            due.push(DueTimer { instance_id: key.instance_id, level: key.level, deadline });
        }
        due
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.queue.first().map(|(deadline, _)| *deadline)
    }

    pub fn deadline_of(&self, instance_id: &InstanceId, level: u32) -> Option<DateTime<Utc>> {
        self.deadlines.get(&TimerKey { instance_id: instance_id.clone(), level }).copied()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Re-registers the open step of every in-flight instance. Returns how
    /// many timers were scheduled.
    pub fn rehydrate<'a>(
        &mut self,
        instances: impl IntoIterator<Item = &'a ApprovalInstance>,
    ) -> usize {
        let mut scheduled = 0;
        for instance in instances {
            if let Some(step) = instance.awaiting_step() {
                self.schedule(instance.id.clone(), step.level, step.deadline);
                scheduled += 1;
            }
        }
        scheduled
    }
}
