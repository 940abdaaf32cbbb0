//! Which address space owns an address.
//!
//! There is one kernel space for the lifetime of the system and, per core, at most one
//! active user space. The per-core slot lives in a [`CpuSpace`] that the scheduler keeps
//! in its per-core context and hands to [`SpaceRegistry::activate`] on every context
//! switch. The slot never keeps a map alive; the owning process does.

use alloc::sync::{Arc, Weak};

use pmm::{Pmap, PmapKind, VirtualAddress};

use crate::Map;

/// The active user address space of one core.
pub struct CpuSpace {
    active: spin::Mutex<Weak<Map>>,
}

impl CpuSpace {
    pub const fn new() -> Self {
        Self {
            active: spin::Mutex::new(Weak::new()),
        }
    }

    /// The user map currently active on this core, if it is still alive.
    pub fn active(&self) -> Option<Arc<Map>> {
        self.active.lock().upgrade()
    }
}

impl Default for CpuSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `f` without being preempted on the current core.
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
fn without_preemption<R>(f: impl FnOnce() -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(not(all(target_arch = "x86_64", not(test), not(feature = "software-emulation"))))]
fn without_preemption<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// The kernel address space plus the routing rules between it and user spaces.
pub struct SpaceRegistry {
    kernel: Arc<Map>,
}

impl SpaceRegistry {
    /// # Panics
    /// Panics if `kernel` is not backed by a kernel pmap.
    pub fn new(kernel: Map) -> Self {
        assert_eq!(
            kernel.pmap().kind(),
            PmapKind::Kernel,
            "kernel space requires a kernel pmap"
        );
        Self {
            kernel: Arc::new(kernel),
        }
    }

    pub fn kernel(&self) -> &Arc<Map> {
        &self.kernel
    }

    /// Creates an empty user address space that shares the kernel's half and can
    /// therefore be activated.
    pub fn new_user_map(&self) -> Map {
        Map::with_pmap(Pmap::new_user(self.kernel.pmap()))
    }

    /// Switches `cpu` to `map`, or to the kernel space alone if `map` is `None`, and
    /// loads the matching translation tables.
    ///
    /// Must be called on the core `cpu` belongs to.
    ///
    /// # Panics
    /// Panics if `map` does not share the kernel half, e.g. one built by [`Map::new`].
    pub fn activate(&self, cpu: &CpuSpace, map: Option<&Arc<Map>>) {
        let pmap = map.map_or(self.kernel.pmap(), |map| map.pmap());
        assert!(pmap.has_kernel_half(), "address space has no kernel half");

        without_preemption(|| {
            let mut active = cpu.active.lock();
            *active = map.map_or_else(Weak::new, Arc::downgrade);

            log::debug!("activating address space {} - {}", pmap.start(), pmap.end());
            // SAFETY: the slot and the hardware are updated together with preemption
            // disabled, and the pmap was checked to carry the kernel half.
            unsafe { pmap.activate() };
        });
    }

    /// Returns the map whose range contains `addr`: the user map active on `cpu` first,
    /// then the kernel space.
    pub fn resolve_owner(&self, cpu: &CpuSpace, addr: VirtualAddress) -> Option<Arc<Map>> {
        if let Some(user) = cpu.active().filter(|map| map.contains(addr)) {
            return Some(user);
        }
        self.kernel
            .contains(addr)
            .then(|| Arc::clone(&self.kernel))
    }
}

static REGISTRY: spin::Once<SpaceRegistry> = spin::Once::new();

/// Installs the global registry around the kernel address space.
///
/// # Panics
/// Panics if the registry was already initialized.
pub fn init_registry(kernel: Map) -> &'static SpaceRegistry {
    install(&REGISTRY, kernel)
}

fn install(slot: &spin::Once<SpaceRegistry>, kernel: Map) -> &SpaceRegistry {
    let mut installed = false;
    let registry = slot.call_once(|| {
        installed = true;
        let (start, end) = kernel.range();
        log::info!("kernel address space {} - {}", start, end);
        SpaceRegistry::new(kernel)
    });
    if !installed {
        panic!("space registry already initialized");
    }
    registry
}

/// Returns the global registry.
///
/// # Panics
/// Panics if [`init_registry`] has not run yet.
pub fn registry() -> &'static SpaceRegistry {
    REGISTRY
        .get()
        .expect("space registry not initialized; call init_registry during boot")
}
