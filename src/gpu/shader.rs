use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use ash::vk::{self, Handle as VkHandle};

use super::descriptor::Descriptor;
use super::error::{GPUError, Result};
use super::structs::ShaderStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationState {
    Idle,
    Compiling,
    Succeeded,
    Failed,
}

/// Blocks waiters until finalization settles, instead of having them poll a
/// flag. The worker thread moves the state and notifies.
pub(crate) struct CompilationGate {
    state: Mutex<CompilationState>,
    cond: Condvar,
}

impl CompilationGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(CompilationState::Idle),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set(&self, next: CompilationState) {
        let mut state = self.state.lock().expect("compilation gate poisoned");
        *state = next;
        drop(state);
        self.cond.notify_all();
    }

    pub(crate) fn current(&self) -> CompilationState {
        *self.state.lock().expect("compilation gate poisoned")
    }

    fn wait_settled(&self) -> CompilationState {
        let mut state = self.state.lock().expect("compilation gate poisoned");
        while matches!(*state, CompilationState::Idle | CompilationState::Compiling) {
            state = self.cond.wait(state).expect("compilation gate poisoned");
        }
        *state
    }
}

pub(crate) struct ShaderInner {
    pub(crate) name: String,
    pub(crate) entry_point: CString,
    pub(crate) stage: ShaderStage,
    pub(crate) descriptors: Vec<Descriptor>,
    /// The vk::ShaderModule handle as a raw u64; written by the worker that
    /// finalizes the module, read by pipeline construction after the gate.
    pub(crate) module: AtomicU64,
    pub(crate) gate: CompilationGate,
}

/// A compiled (or compiling) shader stage. Cheap to clone; the device hands
/// clones to its worker pool for asynchronous finalization.
#[derive(Clone)]
pub struct Shader {
    pub(crate) inner: Arc<ShaderInner>,
}

impl Shader {
    pub(crate) fn new(
        name: &str,
        entry_point: &str,
        stage: ShaderStage,
        descriptors: Vec<Descriptor>,
    ) -> Self {
        let entry = CString::new(entry_point).unwrap_or_else(|_| CString::new("main").unwrap());
        Self {
            inner: Arc::new(ShaderInner {
                name: name.to_string(),
                entry_point: entry,
                stage,
                descriptors,
                module: AtomicU64::new(0),
                gate: CompilationGate::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn stage(&self) -> ShaderStage {
        self.inner.stage
    }

    pub fn entry_point(&self) -> &std::ffi::CStr {
        &self.inner.entry_point
    }

    /// The reflected binding shapes this stage expects.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.inner.descriptors
    }

    pub fn state(&self) -> CompilationState {
        self.inner.gate.current()
    }

    /// Blocks until finalization finishes one way or the other.
    pub fn wait_for_compilation(&self) -> Result<()> {
        match self.inner.gate.wait_settled() {
            CompilationState::Succeeded => Ok(()),
            CompilationState::Failed => Err(GPUError::ShaderCompilationFailed(
                self.inner.name.clone(),
            )),
            _ => unreachable!("gate settled in a non-terminal state"),
        }
    }

    pub(crate) fn module(&self) -> vk::ShaderModule {
        vk::ShaderModule::from_raw(self.inner.module.load(Ordering::Acquire))
    }

    pub(crate) fn finish(&self, module: vk::ShaderModule) {
        self.inner.module.store(module.as_raw(), Ordering::Release);
        self.inner.gate.set(CompilationState::Succeeded);
    }

    pub(crate) fn fail(&self) {
        self.inner.gate.set(CompilationState::Failed);
    }

    pub(crate) fn begin_compiling(&self) {
        self.inner.gate.set(CompilationState::Compiling);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_wakes_waiter_on_success() {
        let shader = Shader::new("test.vert", "main", ShaderStage::VERTEX, Vec::new());
        shader.begin_compiling();
        assert_eq!(shader.state(), CompilationState::Compiling);

        let waiter = {
            let shader = shader.clone();
            std::thread::spawn(move || shader.wait_for_compilation())
        };
        // Give the waiter a moment to actually block on the gate.
        std::thread::sleep(std::time::Duration::from_millis(10));
        shader.finish(vk::ShaderModule::null());

        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(shader.state(), CompilationState::Succeeded);
    }

    #[test]
    fn failed_compilation_surfaces_as_error() {
        let shader = Shader::new("broken.frag", "main", ShaderStage::FRAGMENT, Vec::new());
        shader.begin_compiling();
        shader.fail();
        assert!(shader.wait_for_compilation().is_err());
    }
}
