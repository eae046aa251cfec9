use crate::error::Error;

/// Largest CPU id (exclusive) the kernel affinity mask can describe.
pub const MAX_CPU: usize = libc::CPU_SETSIZE as usize;

const WORDS: usize = MAX_CPU.div_ceil(64);

/// Fixed-size bitmap over `0..MAX_CPU`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSet {
    bits: [u64; WORDS],
}

impl CpuSet {
    pub fn new() -> Self {
        Self { bits: [0; WORDS] }
    }

    /// Adds `cpu` to the set. Ids at or above `MAX_CPU` are ignored.
    pub fn insert(&mut self, cpu: usize) {
        if cpu < MAX_CPU {
            self.bits[cpu / 64] |= 1u64 << (cpu % 64);
        }
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_CPU && self.bits[cpu / 64] & (1u64 << (cpu % 64)) != 0
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// Active CPU ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CPU).filter(move |&cpu| self.contains(cpu))
    }

    fn from_raw(raw: &libc::cpu_set_t) -> Self {
        let mut set = Self::new();
        for cpu in 0..MAX_CPU {
            // SAFETY: cpu < CPU_SETSIZE, so the bit index is within `raw`.
            if unsafe { libc::CPU_ISSET(cpu, raw) } {
                set.insert(cpu);
            }
        }
        set
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = Self::new();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

/// Queries the set of CPUs this process may run on.
pub fn discover() -> Result<CpuSet, Error> {
    // SAFETY: cpu_set_t is plain data; all-zero is the empty set.
    let mut raw: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let ret =
        unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut raw) };
    if ret != 0 {
        return Err(Error::Affinity(format!(
            "sched_getaffinity failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let set = CpuSet::from_raw(&raw);
    if set.is_empty() {
        return Err(Error::Affinity("process affinity mask is empty".into()));
    }
    log::debug!("discovered {} usable CPUs", set.len());
    Ok(set)
}

/// Pins the calling thread to a single CPU.
pub trait Binder: Sync {
    fn bind(&self, cpu: usize) -> Result<(), Error>;
}

/// Binds through `sched_setaffinity` on the calling thread.
pub struct ThreadAffinity;

impl Binder for ThreadAffinity {
    fn bind(&self, cpu: usize) -> Result<(), Error> {
        if cpu >= MAX_CPU {
            return Err(Error::Affinity(format!("cpu {} out of range", cpu)));
        }
        unsafe {
            let mut mask: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut mask);
            libc::CPU_SET(cpu, &mut mask);
            // pid 0 targets the calling thread, not the whole process.
            let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mask);
            if ret != 0 {
                return Err(Error::Affinity(format!(
                    "failed to pin to cpu {}: {}",
                    cpu,
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }
}
