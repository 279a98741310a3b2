/// Load a module into a fresh [`Loader`](crate::Loader) in one step
///
/// Evaluates to `Result<(Loader, ModuleHandle)>`. The single-argument form
/// opens a path and needs the `fs` feature.
/// # Example
/// ```no_run
/// # use md64_loader::load_module;
/// # use md64_loader::host::{CpuClass, CpuFeatures, HostProfile};
/// // from memory
/// # let bytes: [u8; 0] = [];
/// let (loader, nic) = load_module!("NE2000.MOD", &bytes).unwrap();
/// // from memory, for a given host
/// # let bytes: [u8; 0] = [];
/// let host = HostProfile::new(CpuClass::I80486, CpuFeatures::FPU);
/// let (loader, nic) = load_module!("NE2000.MOD", &bytes, host: host).unwrap();
/// ```
#[macro_export]
macro_rules! load_module {
    ($path:expr) => {
        $crate::input::ModuleFile::from_path($path).and_then(|file| {
            let mut loader = $crate::Loader::new();
            loader.load_module(file).map(|handle| (loader, handle))
        })
    };
    ($name:expr, $bytes:expr) => {{
        let mut loader = $crate::Loader::new();
        loader
            .load_module($crate::input::ModuleBinary::new($name, $bytes))
            .map(|handle| (loader, handle))
    }};
    ($name:expr, $bytes:expr, host: $host:expr) => {{
        let mut loader = $crate::Loader::new().with_host($host);
        loader
            .load_module($crate::input::ModuleBinary::new($name, $bytes))
            .map(|handle| (loader, handle))
    }};
}
