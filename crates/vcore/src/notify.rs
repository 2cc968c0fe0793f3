use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::Serialize;

use crate::drc::DrcKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HotplugEventKind {
    Add,
    Remove,
}

/// Hotplug notification queued for the guest, identifying the connector by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HotplugEvent {
    pub kind: HotplugEventKind,
    pub resource: DrcKind,
    pub drc_index: u32,
}

impl HotplugEvent {
    pub fn add(resource: DrcKind, drc_index: u32) -> Self {
        Self {
            kind: HotplugEventKind::Add,
            resource,
            drc_index,
        }
    }

    pub fn remove(resource: DrcKind, drc_index: u32) -> Self {
        Self {
            kind: HotplugEventKind::Remove,
            resource,
            drc_index,
        }
    }
}

/// Guest notification channel. Fire-and-forget: enqueuing never blocks and never fails.
pub trait HotplugNotifier {
    fn enqueue_hotplug_event(&mut self, event: HotplugEvent);
}

impl<F> HotplugNotifier for F
where
    F: FnMut(HotplugEvent),
{
    fn enqueue_hotplug_event(&mut self, event: HotplugEvent) {
        self(event);
    }
}

/// Cloneable FIFO of hotplug events shared between the machine and whoever drains it for the
/// guest.
#[derive(Debug, Clone, Default)]
pub struct HotplugEventQueue {
    events: Rc<RefCell<VecDeque<HotplugEvent>>>,
}

impl HotplugEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    /// Pops the oldest event.
    pub fn pop(&self) -> Option<HotplugEvent> {
        self.events.borrow_mut().pop_front()
    }

    pub fn drain(&self) -> Vec<HotplugEvent> {
        self.events.borrow_mut().drain(..).collect()
    }

    /// Copies the queued events without consuming them.
    pub fn snapshot(&self) -> Vec<HotplugEvent> {
        self.events.borrow().iter().copied().collect()
    }
}

impl HotplugNotifier for HotplugEventQueue {
    fn enqueue_hotplug_event(&mut self, event: HotplugEvent) {
        self.events.borrow_mut().push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_one_queue() {
        let queue = HotplugEventQueue::new();
        let mut sink = queue.clone();
        sink.enqueue_hotplug_event(HotplugEvent::add(DrcKind::Cpu, 0x1000_0000));
        sink.enqueue_hotplug_event(HotplugEvent::remove(DrcKind::Cpu, 0x1000_0000));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().map(|e| e.kind), Some(HotplugEventKind::Add));
        assert_eq!(queue.drain().len(), 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn closures_are_notifiers() {
        let mut seen = Vec::new();
        {
            let mut sink = |event: HotplugEvent| seen.push(event);
            sink.enqueue_hotplug_event(HotplugEvent::add(DrcKind::Cpu, 1));
        }
        assert_eq!(seen, vec![HotplugEvent::add(DrcKind::Cpu, 1)]);
    }
}
