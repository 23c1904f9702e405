use std::ops::ControlFlow;

use crate::error::{MetadataError, RuntimeError};

/// Opaque handle the runtime uses for a managed thread.
///
/// Handles can be reused by the runtime once a thread dies, so this is only a transient key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadHandle(pub u64);

/// Opaque per-method identifier reported by a stack walk. Zero means the frame has no managed
/// method (native code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u64);

impl MethodId {
    pub fn is_native(&self) -> bool {
        self.0 == 0
    }
}

/// Per-frame context handed out by the stack walk. Only meaningful while that walk is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameContext(pub u64);

/// Runtime identifier of a loaded type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u64);

/// What the sampler knows about a thread beyond its handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadIdentity {
    pub native_id: u32,
    pub name: String,
}

/// Result of looking up a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// `None` for shared generic code, which has no single declaring class.
    pub class: Option<ClassId>,
    pub name: String,
}

/// Type and method metadata exposed by the host runtime.
pub trait MetadataSource {
    fn method_info(&self, method: MethodId, context: FrameContext)
        -> Result<MethodInfo, MetadataError>;

    fn type_name(&self, class: ClassId) -> Result<String, MetadataError>;
}

/// The host runtime's profiling interface.
///
/// Everything between `suspend_all` and `resume_all` runs while every managed thread is frozen.
/// Implementations must not call back into code that application threads may be holding locks
/// in.
pub trait ProfilingRuntime: MetadataSource {
    fn suspend_all(&self) -> Result<(), RuntimeError>;

    fn resume_all(&self) -> Result<(), RuntimeError>;

    /// Fills `threads` with every thread the runtime knows about. `threads` is cleared first and
    /// has been allocated before the runtime was suspended.
    fn enumerate_threads(&self, threads: &mut Vec<ThreadHandle>) -> Result<(), RuntimeError>;

    /// Walks the stack of `thread` from the innermost frame outwards, calling `visit` once per
    /// frame. The walk stops early if `visit` returns `ControlFlow::Break`.
    fn walk_stack(
        &self,
        thread: ThreadHandle,
        visit: &mut dyn FnMut(MethodId, FrameContext) -> ControlFlow<()>,
    ) -> Result<(), RuntimeError>;
}
