//! Device context: an explicit stand-in for what the original system models
//! as a process-wide CPU allocator singleton.
//!
//! Per the design notes, global allocator state is modeled here as an
//! explicit context value threaded into storage construction rather than a
//! hidden global. Only a CPU device is supported (as in the source system);
//! the type exists so call sites that construct tensor storage take a
//! `&DeviceContext` rather than reaching for ambient global state, leaving
//! room for a GPU/accelerator context to be added later without changing
//! call-site shape.

/// The kind of compute device backing a [`DeviceContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// The host CPU. Currently the only supported kind.
    Cpu,
}

/// An explicit handle to the device new tensor storage should be allocated
/// on. There is currently only one: [`DeviceContext::cpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceContext {
    kind: DeviceKind,
}

impl DeviceContext {
    /// The (only) CPU device context.
    pub fn cpu() -> Self {
        DeviceContext { kind: DeviceKind::Cpu }
    }

    /// The kind of device this context refers to.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        DeviceContext::cpu()
    }
}
