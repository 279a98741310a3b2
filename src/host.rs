//! Host capabilities and instrumentation clock.
//!
//! The loader never inspects the machine itself. Whoever starts the runtime
//! detects the CPU once and hands the result to the loader as a [`HostProfile`].

use bitflags::bitflags;
use core::fmt::Display;

/// CPU class, ordered by capability.
///
/// The raw values are the codes stored in the `required_cpu` header field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuClass(pub u16);

impl CpuClass {
    pub const I8086: CpuClass = CpuClass(0x0086);
    pub const I80286: CpuClass = CpuClass(0x0286);
    pub const I80386: CpuClass = CpuClass(0x0386);
    pub const I80486: CpuClass = CpuClass(0x0486);
    pub const PENTIUM: CpuClass = CpuClass(0x0586);

    /// Parses names such as `286`, `80386`, `i486` or `pentium`.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim_start_matches(['i', 'I']);
        match name {
            "86" | "8086" | "8088" => Some(Self::I8086),
            "286" | "80286" => Some(Self::I80286),
            "386" | "80386" => Some(Self::I80386),
            "486" | "80486" => Some(Self::I80486),
            "586" | "pentium" | "Pentium" => Some(Self::PENTIUM),
            _ => None,
        }
    }
}

impl Display for CpuClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            CpuClass::I8086 => f.write_str("8086"),
            CpuClass::I80286 => f.write_str("80286"),
            CpuClass::I80386 => f.write_str("80386"),
            CpuClass::I80486 => f.write_str("80486"),
            CpuClass::PENTIUM => f.write_str("Pentium"),
            CpuClass(raw) => write!(f, "cpu(0x{raw:04x})"),
        }
    }
}

bitflags! {
    /// Optional CPU features a module may require.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CpuFeatures: u16 {
        /// Floating point unit present.
        const FPU = 0x0001;
        /// MMX instructions available.
        const MMX = 0x0002;
        /// CPUID instruction available.
        const CPUID = 0x0004;
    }
}

/// What the host detected at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostProfile {
    pub cpu: CpuClass,
    pub features: CpuFeatures,
}

impl Default for HostProfile {
    /// A 386 without an FPU, the smallest machine the driver targets for
    /// protected-mode capable modules.
    fn default() -> Self {
        Self {
            cpu: CpuClass::I80386,
            features: CpuFeatures::empty(),
        }
    }
}

impl HostProfile {
    pub const fn new(cpu: CpuClass, features: CpuFeatures) -> Self {
        Self { cpu, features }
    }

    /// Whether this host satisfies a module's CPU class.
    #[inline]
    pub fn supports_cpu(&self, required: CpuClass) -> bool {
        required <= self.cpu
    }

    /// Whether every bit of `required` is present on this host.
    ///
    /// Bits without a name are compared too, so a module asking for a feature
    /// this runtime has never heard of is refused.
    #[inline]
    pub fn supports_features(&self, required: u16) -> bool {
        required & !self.features.bits() == 0
    }
}

/// A monotonic clock used only to instrument loads.
pub trait Clock {
    /// Microseconds since an arbitrary fixed point.
    fn now_us(&self) -> u64;
}

/// A clock that always reads zero; timings come out as 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoClock;

impl Clock for NoClock {
    #[inline]
    fn now_us(&self) -> u64 {
        0
    }
}

impl<F: Fn() -> u64> Clock for F {
    fn now_us(&self) -> u64 {
        self()
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use std::time::Instant;

        /// Clock backed by [`std::time::Instant`].
        #[derive(Clone, Copy, Debug)]
        pub struct StdClock {
            origin: Instant,
        }

        impl Default for StdClock {
            fn default() -> Self {
                Self {
                    origin: Instant::now(),
                }
            }
        }

        impl Clock for StdClock {
            fn now_us(&self) -> u64 {
                self.origin.elapsed().as_micros() as u64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_ordering() {
        assert!(CpuClass::I8086 < CpuClass::I80286);
        assert!(CpuClass::I80486 < CpuClass::PENTIUM);
        assert_eq!(CpuClass::from_name("i486"), Some(CpuClass::I80486));
        assert_eq!(CpuClass::from_name("z80"), None);
    }

    #[test]
    fn feature_subset() {
        let host = HostProfile::new(CpuClass::I80486, CpuFeatures::FPU | CpuFeatures::CPUID);
        assert!(host.supports_features(0));
        assert!(host.supports_features(CpuFeatures::FPU.bits()));
        assert!(!host.supports_features(CpuFeatures::MMX.bits()));
        assert!(!host.supports_features(0x8000));
        assert!(host.supports_cpu(CpuClass::I80286));
        assert!(!host.supports_cpu(CpuClass::PENTIUM));
    }
}
