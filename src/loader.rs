use crate::{
    Error, Result,
    addr::FarPtr,
    arena::{Arena, MemoryClass, ParagraphArena, Placement},
    error::{state_error, symbol_not_found},
    header::validate,
    host::{Clock, HostProfile, NoClock},
    input::{IntoImageReader, read_image},
    lifecycle::{EntryDispatcher, EntryKind, EntryOutcome, ModuleHandle, ModuleInstance, ModuleState},
    registry::SymbolRegistry,
    relocation::{apply_relocations, relocation_table},
    segment::SegmentAllocator,
    thunk::ThunkDispatcher,
};
use alloc::{borrow::ToOwned, format, sync::Arc, vec::Vec};

/// Maximum number of modules loaded at once.
pub const MAX_MODULES: usize = 16;

/// Init taking longer than this many microseconds is reported.
pub const INIT_BUDGET_US: u64 = 100_000;

/// Counters kept across the lifetime of a loader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Successful loads.
    pub loads: u64,
    /// Completed unloads, including ones whose cleanup reported failure.
    pub unloads: u64,
    /// Loads that failed and were rolled back.
    pub failures: u64,
    pub cold_bytes_reclaimed: u64,
}

/// The module loader.
///
/// `Loader` sequences validation, placement, relocation, publication and init
/// for every module and owns the resulting instances. Each call either
/// completes or rolls back entirely: a failed load leaves arena usage and the
/// symbol registry exactly as they were.
///
/// # Examples
/// ```rust
/// use md64_loader::Loader;
///
/// let mut loader = Loader::new().with_auto_discard(false);
/// assert!(loader.load_module(&[0u8; 16][..]).is_err());
/// assert_eq!(loader.stats().failures, 1);
/// ```
pub struct Loader<A = ParagraphArena, X = ThunkDispatcher, C = NoClock>
where
    A: Arena,
    X: EntryDispatcher,
    C: Clock,
{
    arena: A,
    dispatcher: X,
    clock: C,
    host: HostProfile,
    allocator: SegmentAllocator,
    registry: Arc<SymbolRegistry>,
    /// Loaded modules, oldest first.
    modules: Vec<ModuleInstance>,
    auto_discard: bool,
    stats: LoaderStats,
    shut_down: bool,
}

impl Loader {
    /// Creates a loader over the default arena, executing entry points with
    /// [`ThunkDispatcher`].
    pub fn new() -> Self {
        Self::with_arena(ParagraphArena::default())
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arena> Loader<A> {
    /// Creates a loader that places modules in `arena`.
    pub fn with_arena(arena: A) -> Self {
        Self {
            arena,
            dispatcher: ThunkDispatcher::default(),
            clock: NoClock,
            host: HostProfile::default(),
            allocator: SegmentAllocator::default(),
            registry: Arc::new(SymbolRegistry::new()),
            modules: Vec::new(),
            auto_discard: true,
            stats: LoaderStats::default(),
            shut_down: false,
        }
    }
}

impl<A: Arena, X: EntryDispatcher, C: Clock> Loader<A, X, C> {
    /// Sets what the host detected at startup.
    pub fn with_host(mut self, host: HostProfile) -> Self {
        self.host = host;
        self
    }

    /// Sets the memory class policy for new modules.
    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.allocator = SegmentAllocator::new(placement);
        self
    }

    /// Whether the cold region is reclaimed right after a successful init.
    ///
    /// On by default. Modules without `DISCARD_COLD` are never affected.
    pub fn with_auto_discard(mut self, auto_discard: bool) -> Self {
        self.auto_discard = auto_discard;
        self
    }

    /// Shares `registry` with other loaders instead of owning a private one.
    pub fn with_registry(mut self, registry: Arc<SymbolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Returns a loader calling entry points through `dispatcher`.
    pub fn with_dispatcher<NewX: EntryDispatcher>(self, dispatcher: NewX) -> Loader<A, NewX, C> {
        Loader {
            arena: self.arena,
            dispatcher,
            clock: self.clock,
            host: self.host,
            allocator: self.allocator,
            registry: self.registry,
            modules: self.modules,
            auto_discard: self.auto_discard,
            stats: self.stats,
            shut_down: self.shut_down,
        }
    }

    /// Returns a loader timing its stages with `clock`.
    pub fn with_clock<NewC: Clock>(self, clock: NewC) -> Loader<A, X, NewC> {
        Loader {
            arena: self.arena,
            dispatcher: self.dispatcher,
            clock,
            host: self.host,
            allocator: self.allocator,
            registry: self.registry,
            modules: self.modules,
            auto_discard: self.auto_discard,
            stats: self.stats,
            shut_down: self.shut_down,
        }
    }

    /// Loads, links and initialises a module.
    ///
    /// On any failure the module's memory is released and its exports are
    /// withdrawn before the error is returned.
    ///
    /// # Arguments
    /// - `input` - Anything convertible into an [`ImageReader`](crate::input::ImageReader):
    ///   a byte slice, a [`ModuleBinary`](crate::input::ModuleBinary), or with
    ///   the `fs` feature a path or [`ModuleFile`](crate::input::ModuleFile).
    ///
    /// # Returns
    /// - `Ok(handle)` - The module is linked, initialised and its exports published.
    /// - `Err` - The first failure; [`Error::class`] tells structural, resource,
    ///   linkage and behavioral failures apart.
    pub fn load_module<'a, I: IntoImageReader<'a>>(&mut self, input: I) -> Result<ModuleHandle> {
        match self.load_impl(input) {
            Ok(handle) => {
                self.stats.loads += 1;
                Ok(handle)
            }
            Err(err) => {
                self.stats.failures += 1;
                #[cfg(feature = "log")]
                log::debug!("[Load] failed: {}", err);
                Err(err)
            }
        }
    }

    fn load_impl<'a, I: IntoImageReader<'a>>(&mut self, input: I) -> Result<ModuleHandle> {
        if self.shut_down {
            return Err(state_error("loader has been shut down"));
        }
        let start = self.clock.now_us();
        let mut reader = input.into_reader()?;
        let image = read_image(&mut reader)?;
        let (header, exports) = validate(&image, &self.host)?;
        let validated = self.clock.now_us();
        #[cfg(feature = "log")]
        log::debug!(
            "[Load] {}: module [{}], {} paragraphs, {} exports, {} relocations",
            crate::input::ImageReader::shortname(&reader),
            header.name(),
            header.total_size_para,
            header.export_count,
            header.reloc_count
        );

        if self.modules.len() >= MAX_MODULES {
            let classes = self.allocator.placement().classes();
            return Err(Error::AllocationFailed {
                paragraphs: header.total_size_para as u32,
                class: *classes.last().unwrap_or(&MemoryClass::Conventional),
            });
        }

        let segments = self.allocator.reserve(&mut self.arena, &header, &image)?;
        let handle = self.registry.allocate_handle();
        let mut instance = ModuleInstance::new(handle, header, exports, segments);
        instance.stats_mut().validate_us = validated.saturating_sub(start);

        if let Err(err) = self.link_and_init(&mut instance, &image) {
            if instance.state().can_advance(ModuleState::Failed) {
                let _ = instance.advance(ModuleState::Failed);
            }
            // keep the load error
            if let Err(_release) = instance.rollback(&mut self.arena, &self.allocator, &self.registry)
            {
                #[cfg(feature = "log")]
                log::warn!("[Load] rollback after \"{}\" failed: {}", err, _release);
            }
            return Err(err);
        }

        let stats = instance.stats_mut();
        stats.total_us = self.clock.now_us().saturating_sub(start);
        self.stats.cold_bytes_reclaimed += stats.cold_bytes_reclaimed as u64;
        #[cfg(feature = "log")]
        log::debug!(
            "[Load] module [{}] {} at 0x{:04x}, {:?}",
            instance.name(),
            handle,
            instance.base(),
            instance.state()
        );
        self.modules.push(instance);
        Ok(handle)
    }

    fn link_and_init(&mut self, instance: &mut ModuleInstance, image: &[u8]) -> Result<()> {
        let before = self.clock.now_us();
        let table = relocation_table(instance.header(), image);
        let applied = apply_relocations(
            &mut self.arena,
            instance.segments(),
            &table,
            &*self.registry,
        )?;
        instance.advance(ModuleState::Linked)?;
        let symbols = instance.published_symbols();
        self.registry.publish(&symbols)?;
        let linked = self.clock.now_us();
        {
            let stats = instance.stats_mut();
            stats.relocations = applied;
            stats.exports = symbols.len();
            stats.relocate_us = linked.saturating_sub(before);
        }

        instance.initialize(&mut self.arena, &mut self.dispatcher)?;
        let init_us = self.clock.now_us().saturating_sub(linked);
        instance.stats_mut().init_us = init_us;
        if init_us > INIT_BUDGET_US {
            #[cfg(feature = "log")]
            log::warn!(
                "[Init] module [{}] took {} us, budget is {} us",
                instance.name(),
                init_us,
                INIT_BUDGET_US
            );
        }

        if self.auto_discard && instance.discards_cold() {
            instance.discard_cold(&mut self.arena, &self.allocator, &self.registry)?;
        }
        Ok(())
    }

    /// Unloads a resident module.
    ///
    /// Returns [`Error::UnloadFailed`] if the module's cleanup reports
    /// failure; the module is gone and its memory released all the same.
    ///
    /// # Arguments
    /// - `handle` - A handle returned by [`Loader::load_module`] on this loader.
    ///
    /// # Returns
    /// - `Ok(())` - The module ran its cleanup and is gone.
    /// - `Err(Error::UnloadFailed)` - Non-fatal, see [`Error::is_non_fatal`].
    /// - `Err(Error::InvalidState)` - If `handle` is unknown or not resident.
    pub fn unload_module(&mut self, handle: ModuleHandle) -> Result<()> {
        let idx = self.index_of(handle)?;
        let state = self.modules[idx].state();
        if !state.is_live() {
            return Err(state_error(format!(
                "module {handle} is {state:?}, only resident modules can be unloaded"
            )));
        }
        let instance = self.modules.remove(idx);
        #[cfg(feature = "log")]
        log::debug!("[Unload] module [{}] {}", instance.name(), handle);
        let result = instance.teardown(
            &mut self.arena,
            &mut self.dispatcher,
            &self.allocator,
            &self.registry,
        );
        self.stats.unloads += 1;
        result
    }

    /// Resolves `name` in the global symbol registry.
    pub fn resolve_symbol(&self, name: &str) -> Result<FarPtr> {
        self.registry
            .resolve(name)
            .map(|symbol| symbol.addr)
            .ok_or_else(|| symbol_not_found(name.to_owned()))
    }

    /// Looks `name` up in the export table of one module.
    pub fn lookup_export(&self, handle: ModuleHandle, name: &str) -> Result<FarPtr> {
        self.instance_ref(handle)?
            .export_address(name)
            .ok_or_else(|| symbol_not_found(name.to_owned()))
    }

    /// Returns a resident module's cold region to the arena.
    ///
    /// Returns the number of bytes freed.
    pub fn discard_cold(&mut self, handle: ModuleHandle) -> Result<usize> {
        let idx = self.index_of(handle)?;
        let instance = &mut self.modules[idx];
        let freed = instance.discard_cold(&mut self.arena, &self.allocator, &self.registry)?;
        self.stats.cold_bytes_reclaimed += freed as u64;
        Ok(freed)
    }

    /// Calls the function at `addr`, which must lie in a loaded module.
    pub fn invoke(&mut self, addr: FarPtr) -> Result<EntryOutcome> {
        let instance = self
            .modules
            .iter()
            .find(|instance| {
                instance.base() == addr.selector
                    && instance.segments().address(addr.offset).is_some()
            })
            .ok_or_else(|| state_error(format!("{addr} is not inside a loaded module")))?;
        instance.call(
            &mut self.arena,
            &mut self.dispatcher,
            EntryKind::Export,
            addr,
            0,
        )
    }

    /// Calls a module's runtime API entry with `function` in `BX`.
    pub fn call_api(&mut self, handle: ModuleHandle, function: u16) -> Result<EntryOutcome> {
        let idx = self.index_of(handle)?;
        let instance = &self.modules[idx];
        let target = instance
            .api_entry()
            .ok_or_else(|| state_error(format!("module {handle} has no API entry")))?;
        instance.call(
            &mut self.arena,
            &mut self.dispatcher,
            EntryKind::Api,
            target,
            function,
        )
    }

    /// Finds a loaded module by its header name.
    pub fn find_module(&self, name: &str) -> Option<ModuleHandle> {
        self.modules
            .iter()
            .find(|instance| instance.name().eq_ignore_ascii_case(name))
            .map(|instance| instance.handle())
    }

    #[inline]
    pub fn instance(&self, handle: ModuleHandle) -> Option<&ModuleInstance> {
        self.modules.iter().find(|instance| instance.handle() == handle)
    }

    /// Loaded modules in load order.
    #[inline]
    pub fn modules(&self) -> &[ModuleInstance] {
        &self.modules
    }

    #[inline]
    pub fn arena(&self) -> &A {
        &self.arena
    }

    #[inline]
    pub fn registry(&self) -> &Arc<SymbolRegistry> {
        &self.registry
    }

    #[inline]
    pub fn host(&self) -> &HostProfile {
        &self.host
    }

    #[inline]
    pub fn stats(&self) -> &LoaderStats {
        &self.stats
    }

    /// Unloads every module, newest first, and tears down the registry.
    ///
    /// Every module is unloaded even if some fail; the first error is returned.
    pub fn shutdown(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(instance) = self.modules.pop() {
            let result = instance.teardown(
                &mut self.arena,
                &mut self.dispatcher,
                &self.allocator,
                &self.registry,
            );
            self.stats.unloads += 1;
            if let Err(err) = result {
                first_err.get_or_insert(err);
            }
        }
        self.registry.shutdown();
        self.shut_down = true;
        #[cfg(feature = "log")]
        log::debug!("[Shutdown] {:?}", self.stats);
        first_err.map_or(Ok(()), Err)
    }

    fn index_of(&self, handle: ModuleHandle) -> Result<usize> {
        self.modules
            .iter()
            .position(|instance| instance.handle() == handle)
            .ok_or_else(|| state_error(format!("no module loaded as {handle}")))
    }

    fn instance_ref(&self, handle: ModuleHandle) -> Result<&ModuleInstance> {
        self.index_of(handle).map(|idx| &self.modules[idx])
    }
}
