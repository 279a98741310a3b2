//! Module instances and their lifecycle
//!
//! A [`ModuleInstance`] walks
//! `Loading -> Linked -> Resident -> (ColdDiscarded) -> Unloading -> Unloaded`,
//! with `Failed` reachable from any step before `Resident`. Every state change
//! goes through [`ModuleInstance::advance`], which refuses transitions the
//! lifecycle does not allow; a second unload of an instance that is already
//! tearing down is rejected there.

use crate::{
    Result,
    addr::FarPtr,
    arena::Arena,
    error::{Error, state_error},
    header::{ModuleFlags, ModuleHeader},
    registry::{ResolvedSymbol, SymbolRegistry},
    segment::{ModuleSegments, SegmentAllocator},
    symbol::{ExportEntry, ExportTable},
};
use alloc::{format, vec::Vec};
use core::fmt::Display;
use delegate::delegate;

/// Opaque identifier of a loaded module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleHandle(u32);

impl ModuleHandle {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl Display for ModuleHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a module instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleState {
    Unloaded,
    /// Validated and placed, relocation pending.
    Loading,
    /// Relocated and published, init pending.
    Linked,
    /// Init succeeded.
    Resident,
    /// Init succeeded and the cold region has been returned.
    ColdDiscarded,
    Unloading,
    /// A step before `Resident` failed; the instance is being rolled back.
    Failed,
}

impl ModuleState {
    /// Whether the lifecycle allows moving from `self` to `to`.
    pub fn can_advance(self, to: ModuleState) -> bool {
        use ModuleState::*;
        matches!(
            (self, to),
            (Unloaded, Loading)
                | (Loading, Linked)
                | (Linked, Resident)
                | (Resident, ColdDiscarded)
                | (Resident | ColdDiscarded, Unloading)
                | (Unloading, Unloaded)
                | (Loading | Linked, Failed)
        )
    }

    /// Whether the module has finished init and is not being torn down.
    #[inline]
    pub fn is_live(self) -> bool {
        matches!(self, ModuleState::Resident | ModuleState::ColdDiscarded)
    }
}

/// Which entry point is being called.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Init,
    Api,
    Isr,
    Unload,
    /// An exported function called by address.
    Export,
}

/// A call into module code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryCall {
    pub kind: EntryKind,
    pub target: FarPtr,
    /// Function selector passed in `BX`, used by the runtime API entry.
    pub function: u16,
}

/// Status reported when an entry point could not run to its return, for
/// example on an unsupported instruction or a fetch from released memory.
pub const DISPATCH_FAULT: u16 = 0xFFFF;

/// Register state when module code returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryOutcome {
    pub ax: u16,
    pub dx: u16,
    pub carry: bool,
}

impl EntryOutcome {
    /// The 32-bit result in `DX:AX`.
    #[inline]
    pub fn value(&self) -> u32 {
        (self.dx as u32) << 16 | self.ax as u32
    }

    /// The failure status of a call of `kind`, if it failed.
    ///
    /// Carry set always means failure. Init and unload also fail on a
    /// non-zero `AX`.
    pub fn failure(&self, kind: EntryKind) -> Option<u16> {
        let status_call = matches!(kind, EntryKind::Init | EntryKind::Unload);
        (self.carry || (status_call && self.ax != 0)).then_some(self.ax)
    }
}

/// The calling convention the host uses to run module code.
///
/// The loader never executes module bytes itself; every entry point goes
/// through this trait.
pub trait EntryDispatcher {
    /// Runs the code at `call.target` inside the module described by `segments`.
    fn call<A: Arena>(
        &mut self,
        arena: &mut A,
        segments: &ModuleSegments,
        call: EntryCall,
    ) -> Result<EntryOutcome>;
}

/// Timing and counters recorded while loading one module.
///
/// Times are in microseconds of the loader's clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub validate_us: u64,
    pub relocate_us: u64,
    pub init_us: u64,
    pub total_us: u64,
    pub relocations: usize,
    pub exports: usize,
    /// Bytes returned when the cold region was discarded.
    pub cold_bytes_reclaimed: usize,
}

/// A module placed in memory.
///
/// Owned by the loader from allocation until a completed unload or a rollback.
pub struct ModuleInstance {
    handle: ModuleHandle,
    header: ModuleHeader,
    exports: ExportTable,
    segments: ModuleSegments,
    state: ModuleState,
    stats: LoadStats,
}

impl core::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("handle", &self.handle)
            .field("name", &self.header.name())
            .field("state", &self.state)
            .field("segments", &self.segments)
            .finish()
    }
}

impl ModuleInstance {
    pub(crate) fn new(
        handle: ModuleHandle,
        header: ModuleHeader,
        exports: ExportTable,
        segments: ModuleSegments,
    ) -> Self {
        Self {
            handle,
            header,
            exports,
            segments,
            state: ModuleState::Loading,
            stats: LoadStats::default(),
        }
    }

    #[inline]
    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    #[inline]
    pub fn state(&self) -> ModuleState {
        self.state
    }

    #[inline]
    pub fn header(&self) -> &ModuleHeader {
        &self.header
    }

    #[inline]
    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    #[inline]
    pub fn segments(&self) -> &ModuleSegments {
        &self.segments
    }

    #[inline]
    pub fn stats(&self) -> &LoadStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut LoadStats {
        &mut self.stats
    }

    delegate! {
        to self.header {
            /// The module name from the header.
            pub fn name(&self) -> &str;
            pub fn discards_cold(&self) -> bool;
        }
        to self.segments {
            /// Base selector of the module.
            pub fn base(&self) -> crate::addr::Selector;
            pub fn is_cold_reclaimed(&self) -> bool;
        }
    }

    /// Moves to `to`, or fails without changing state.
    pub(crate) fn advance(&mut self, to: ModuleState) -> Result<()> {
        if !self.state.can_advance(to) {
            return Err(state_error(format!(
                "module [{}] cannot go from {:?} to {:?}",
                self.header.name(),
                self.state,
                to
            )));
        }
        #[cfg(feature = "log")]
        log::trace!(
            "[Lifecycle] module [{}] {:?} -> {:?}",
            self.header.name(),
            self.state,
            to
        );
        self.state = to;
        Ok(())
    }

    /// Address of the export entry, if its byte is still owned.
    fn entry_address(&self, entry: &ExportEntry) -> Option<FarPtr> {
        self.segments.address(entry.offset)
    }

    /// Intra-module lookup: binary search of this module's export table.
    ///
    /// Fails for symbols that lived in a reclaimed cold region.
    pub fn export_address(&self, name: &str) -> Option<FarPtr> {
        self.exports
            .lookup(name)
            .and_then(|entry| self.entry_address(entry))
    }

    /// The runtime API entry point.
    pub fn api_entry(&self) -> Option<FarPtr> {
        self.header
            .api_entry()
            .and_then(|offset| self.segments.address(offset))
    }

    /// The interrupt handler entry point, when the module declares one.
    ///
    /// The loader never installs the handler; the caller owns that, and must
    /// quiesce it before unloading.
    pub fn isr_entry(&self) -> Option<FarPtr> {
        if !self.header.flags.contains(ModuleFlags::HAS_ISR) {
            return None;
        }
        self.header
            .isr_entry()
            .and_then(|offset| self.segments.address(offset))
    }

    /// The export table as registry entries.
    pub(crate) fn published_symbols(&self) -> Vec<ResolvedSymbol> {
        self.exports
            .entries()
            .iter()
            .filter_map(|entry| {
                Some(ResolvedSymbol {
                    name: entry.name,
                    addr: self.entry_address(entry)?,
                    flags: entry.flags,
                    module: self.handle,
                })
            })
            .collect()
    }

    /// Calls an entry point of this module.
    pub(crate) fn call<A: Arena, X: EntryDispatcher>(
        &self,
        arena: &mut A,
        dispatcher: &mut X,
        kind: EntryKind,
        target: FarPtr,
        function: u16,
    ) -> Result<EntryOutcome> {
        dispatcher.call(
            arena,
            &self.segments,
            EntryCall {
                kind,
                target,
                function,
            },
        )
    }

    /// Runs init and moves to `Resident`, or to `Failed` if init reports failure.
    ///
    /// A module without an init entry is resident immediately.
    pub(crate) fn initialize<A: Arena, X: EntryDispatcher>(
        &mut self,
        arena: &mut A,
        dispatcher: &mut X,
    ) -> Result<()> {
        if let Some(offset) = self.header.init_entry() {
            let target = FarPtr::new(self.segments.base(), offset);
            let outcome = match self.call(arena, dispatcher, EntryKind::Init, target, 0) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.advance(ModuleState::Failed)?;
                    return Err(Error::InitFailed {
                        status: DISPATCH_FAULT,
                        msg: format!("module [{}] init crashed: {}", self.header.name(), err)
                            .into(),
                    });
                }
            };
            if let Some(status) = outcome.failure(EntryKind::Init) {
                self.advance(ModuleState::Failed)?;
                return Err(Error::InitFailed {
                    status,
                    msg: format!("module [{}] init returned failure", self.header.name()).into(),
                });
            }
        }
        self.advance(ModuleState::Resident)
    }

    /// Returns the cold region to the arena and withdraws any export in it.
    pub(crate) fn discard_cold<A: Arena>(
        &mut self,
        arena: &mut A,
        allocator: &SegmentAllocator,
        registry: &SymbolRegistry,
    ) -> Result<usize> {
        if self.state != ModuleState::Resident {
            return Err(state_error(format!(
                "module [{}] is {:?}, cold region can only be discarded once resident",
                self.header.name(),
                self.state
            )));
        }
        // the validator keeps every post-init entry out of a discardable region
        if !self.header.discards_cold() {
            return Err(state_error(format!(
                "module [{}] has no discardable cold region",
                self.header.name()
            )));
        }
        let cold = self.segments.cold_range();
        registry.withdraw_range(self.handle, cold);
        let freed = allocator.reclaim_cold_region(arena, &mut self.segments)?;
        self.stats.cold_bytes_reclaimed = freed;
        self.advance(ModuleState::ColdDiscarded)?;
        Ok(freed)
    }

    /// Unloads the module: withdraw, cleanup, release.
    ///
    /// Memory is released and exports withdrawn whatever cleanup reports.
    pub(crate) fn teardown<A: Arena, X: EntryDispatcher>(
        mut self,
        arena: &mut A,
        dispatcher: &mut X,
        allocator: &SegmentAllocator,
        registry: &SymbolRegistry,
    ) -> Result<()> {
        self.advance(ModuleState::Unloading)?;
        registry.withdraw(self.handle);
        let cleanup = match self.header.unload_entry() {
            Some(offset) => {
                let target = FarPtr::new(self.segments.base(), offset);
                match self.call(arena, dispatcher, EntryKind::Unload, target, 0) {
                    Ok(outcome) => match outcome.failure(EntryKind::Unload) {
                        Some(status) => Err(Error::UnloadFailed { status }),
                        None => Ok(()),
                    },
                    Err(_err) => {
                        #[cfg(feature = "log")]
                        log::warn!(
                            "[Unload] module [{}] cleanup crashed: {}",
                            self.header.name(),
                            _err
                        );
                        Err(Error::UnloadFailed {
                            status: DISPATCH_FAULT,
                        })
                    }
                }
            }
            None => Ok(()),
        };
        self.advance(ModuleState::Unloaded)?;
        #[cfg(feature = "log")]
        {
            if let Err(err) = &cleanup {
                log::warn!("[Unload] module [{}]: {}", self.header.name(), err);
            }
        }
        allocator.release(arena, self.segments)?;
        cleanup
    }

    /// Undoes a failed load: withdraw whatever was published and release memory.
    pub(crate) fn rollback<A: Arena>(
        self,
        arena: &mut A,
        allocator: &SegmentAllocator,
        registry: &SymbolRegistry,
    ) -> Result<()> {
        registry.withdraw(self.handle);
        allocator.release(arena, self.segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        use ModuleState::*;
        assert!(Loading.can_advance(Linked));
        assert!(Linked.can_advance(Failed));
        assert!(ColdDiscarded.can_advance(Unloading));
        assert!(!Resident.can_advance(Failed));
        assert!(!Unloading.can_advance(Unloading));
        assert!(!ColdDiscarded.can_advance(Resident));
        assert!(!Failed.can_advance(Resident));
    }

    #[test]
    fn outcome_failure_rules() {
        let ok = EntryOutcome {
            ax: 0,
            dx: 1,
            carry: false,
        };
        assert_eq!(ok.value(), 0x0001_0000);
        assert_eq!(ok.failure(EntryKind::Init), None);
        let nonzero = EntryOutcome {
            ax: 5,
            ..ok
        };
        assert_eq!(nonzero.failure(EntryKind::Init), Some(5));
        assert_eq!(nonzero.failure(EntryKind::Export), None);
        let carry = EntryOutcome {
            carry: true,
            ..ok
        };
        assert_eq!(carry.failure(EntryKind::Api), Some(0));
    }
}
