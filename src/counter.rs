use serde::Deserialize;

use crate::error::Error;

/// A monotonically advancing counter read from the sampling loop.
pub trait CounterSource: Send {
    /// Reads the counter. Called twice per sample; must not allocate or block.
    fn read(&mut self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Rdtsc,
    Rdtscp,
}

impl EngineKind {
    pub fn name(self) -> &'static str {
        match self {
            EngineKind::Rdtsc => "rdtsc",
            EngineKind::Rdtscp => "rdtscp",
        }
    }

    /// Number of low delta bits used for classification.
    pub fn bit_width(self) -> u32 {
        match self {
            EngineKind::Rdtsc => 64,
            EngineKind::Rdtscp => 32,
        }
    }

    /// Fails if the instruction cannot run on this machine.
    pub fn check_available(self) -> Result<(), Error> {
        #[cfg(target_arch = "x86_64")]
        {
            match self {
                EngineKind::Rdtsc => Ok(()),
                EngineKind::Rdtscp if x86::has_rdtscp() => Ok(()),
                EngineKind::Rdtscp => {
                    Err(Error::Unsupported("RDTSCP not supported on this CPU".into()))
                }
            }
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            Err(Error::Unsupported(format!(
                "{} requires an x86_64 time-stamp counter",
                self.name()
            )))
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use core::arch::x86_64::__cpuid;
    use core::sync::atomic::{AtomicU8, Ordering};

    // 0 = unchecked, 1 = absent, 2 = present
    static RDTSCP_SUPPORT: AtomicU8 = AtomicU8::new(0);

    /// Checks CPUID leaf 0x8000_0001, EDX bit 27 for RDTSCP support.
    pub fn has_rdtscp() -> bool {
        let cached = RDTSCP_SUPPORT.load(Ordering::Relaxed);
        if cached != 0 {
            return cached == 2;
        }

        // SAFETY: CPUID is always available on x86_64.
        let max_ext = unsafe { __cpuid(0x8000_0000) }.eax;
        let present = if max_ext < 0x8000_0001 {
            false
        } else {
            let edx = unsafe { __cpuid(0x8000_0001) }.edx;
            (edx >> 27) & 1 == 1
        };

        RDTSCP_SUPPORT.store(if present { 2 } else { 1 }, Ordering::Relaxed);
        present
    }
}

/// Plain `RDTSC` reads.
pub struct Rdtsc;

impl CounterSource for Rdtsc {
    #[inline(always)]
    fn read(&mut self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: RDTSC is present on every x86_64 CPU.
            unsafe { core::arch::x86_64::_rdtsc() }
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            unreachable!("rdtsc engine started without availability check")
        }
    }
}

/// `RDTSCP` reads. The TSC_AUX value is captured and discarded.
pub struct Rdtscp {
    aux: u32,
}

impl Rdtscp {
    pub fn new() -> Self {
        Self { aux: 0 }
    }
}

impl Default for Rdtscp {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for Rdtscp {
    #[inline(always)]
    fn read(&mut self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: only constructed after `has_rdtscp` returned true.
            unsafe { core::arch::x86_64::__rdtscp(&mut self.aux) }
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            unreachable!("rdtscp engine started without availability check")
        }
    }
}
