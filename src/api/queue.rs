//! Deferred aux-command queue.
//!
//! Commands that arrive while the link is busy (or powered down, for the
//! subset that runs without the modem) are parked here and drained one per
//! tick. Admission is duplicate-suppressed: a command already waiting keeps
//! its earlier slot and the new request collapses into it.

use super::LinkCommand;

/// Fixed queue capacity.
pub const AUX_Q_LEN: usize = 10;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Already waiting; the earlier slot stands.
    Duplicate,
    /// No free slot; the command is dropped.
    Full,
}

#[derive(Debug, Default)]
pub struct AuxCommandQueue {
    slots: Vec<LinkCommand>,
}

impl AuxCommandQueue {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(AUX_Q_LEN),
        }
    }

    pub fn push(&mut self, cmd: LinkCommand) -> Admission {
        if self.slots.contains(&cmd) {
            return Admission::Duplicate;
        }
        if self.slots.len() >= AUX_Q_LEN {
            return Admission::Full;
        }
        self.slots.push(cmd);
        Admission::Admitted
    }

    /// Oldest waiting command; the slot is freed so the same command can be
    /// admitted again later.
    pub fn pop(&mut self) -> Option<LinkCommand> {
        if self.slots.is_empty() {
            None
        } else {
            Some(self.slots.remove(0))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, cmd: LinkCommand) -> bool {
        self.slots.contains(&cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_are_suppressed() {
        let mut q = AuxCommandQueue::new();
        assert_eq!(q.push(LinkCommand::RingerOn), Admission::Admitted);
        assert_eq!(q.push(LinkCommand::Relay1On), Admission::Admitted);
        assert_eq!(q.push(LinkCommand::RingerOn), Admission::Duplicate);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_fifo_order_preserved() {
        let mut q = AuxCommandQueue::new();
        q.push(LinkCommand::Relay2On);
        q.push(LinkCommand::RingerOff);
        q.push(LinkCommand::Relay2On);
        assert_eq!(q.pop(), Some(LinkCommand::Relay2On));
        assert_eq!(q.pop(), Some(LinkCommand::RingerOff));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_pop_frees_slot_for_readmission() {
        let mut q = AuxCommandQueue::new();
        q.push(LinkCommand::ResetAux);
        assert_eq!(q.pop(), Some(LinkCommand::ResetAux));
        assert_eq!(q.push(LinkCommand::ResetAux), Admission::Admitted);
    }

    #[test]
    fn test_capacity_limit() {
        let mut q = AuxCommandQueue::new();
        let cmds = [
            LinkCommand::RingerOn,
            LinkCommand::RingerOff,
            LinkCommand::RingerStatus,
            LinkCommand::Relay1On,
            LinkCommand::Relay1Off,
            LinkCommand::Relay1Status,
            LinkCommand::Relay2On,
            LinkCommand::Relay2Off,
            LinkCommand::Relay2Status,
            LinkCommand::ResetAux,
        ];
        for cmd in cmds {
            assert_eq!(q.push(cmd), Admission::Admitted);
        }
        assert_eq!(q.push(LinkCommand::CallHangup), Admission::Full);
    }
}
