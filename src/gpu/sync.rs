use ash::vk;

/// Host-side tracking of where a sync primitive sits in its signal cycle.
/// The GPU owns the truth; this mirror exists so submission code can decide
/// which semaphores to wait on without querying the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Signaled,
}

#[derive(Debug)]
pub struct Fence {
    pub(crate) raw: vk::Fence,
    pub(crate) state: SyncState,
}

impl Fence {
    /// Fences start signaled so the first wait on a fresh command list
    /// returns immediately.
    pub(crate) fn new(raw: vk::Fence) -> Self {
        Self {
            raw,
            state: SyncState::Signaled,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }
}

#[derive(Debug)]
pub struct Semaphore {
    pub(crate) raw: vk::Semaphore,
    pub(crate) state: SyncState,
    pub(crate) timeline: bool,
    /// Monotonically increasing target for timeline semaphores; unused for
    /// binary ones.
    pub(crate) value: u64,
}

impl Semaphore {
    pub(crate) fn binary(raw: vk::Semaphore) -> Self {
        Self {
            raw,
            state: SyncState::Idle,
            timeline: false,
            value: 0,
        }
    }

    pub(crate) fn timeline(raw: vk::Semaphore) -> Self {
        Self {
            raw,
            state: SyncState::Idle,
            timeline: true,
            value: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_timeline(&self) -> bool {
        self.timeline
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub(crate) fn next_value(&mut self) -> u64 {
        debug_assert!(self.timeline);
        self.value += 1;
        self.value
    }
}
