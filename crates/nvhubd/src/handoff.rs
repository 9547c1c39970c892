//! Remembers which application had focus before the hub took it, so it can be handed back.

use crate::focus::AppHandle;
use crate::normalize::Location;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationTarget {
    pub application: AppHandle,
    /// Instances that were tracked when the handoff began.
    pub instances: Vec<Location>,
}

/// Where focus should go when the recorded target is handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnFocus {
    Application(AppHandle),
    Instance(Location),
}

/// Single slot: recording a new target replaces the previous one.
#[derive(Debug, Default)]
pub struct HandoffTracker {
    slot: Option<ActivationTarget>,
}

impl HandoffTracker {
    pub fn record(&mut self, application: AppHandle, instances: Vec<Location>) {
        self.slot = Some(ActivationTarget {
            application,
            instances,
        });
    }

    pub fn current(&self) -> Option<&ActivationTarget> {
        self.slot.as_ref()
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }

    /// Empties the slot and decides where focus returns to. If the recorded
    /// application has since become a tracked instance, focus goes to that
    /// instance instead.
    pub fn take_return(
        &mut self,
        owner_of: impl Fn(&AppHandle) -> Option<Location>,
    ) -> Option<ReturnFocus> {
        let target = self.slot.take()?;
        Some(match owner_of(&target.application) {
            Some(location) => ReturnFocus::Instance(location),
            None => ReturnFocus::Application(target.application),
        })
    }
}
