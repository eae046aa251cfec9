use std::ffi::CStr;
use std::io::{self, Write};

use crate::error::Error;
use crate::histogram::{Histogram, TABLE_WIDTH};
use crate::topology::CpuSet;

/// Writes the run header once, then one block of rows per engine.
pub struct Reporter<W: Write> {
    out: W,
    hostname: String,
    reps: u64,
    flag_backwards: bool,
    header_written: bool,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, hostname: String, reps: u64, flag_backwards: bool) -> Self {
        Self {
            out,
            hostname,
            reps,
            flag_backwards,
            header_written: false,
        }
    }

    /// Writes `engine`'s rows for buckets `1..width`, preceded by the header
    /// on the first call.
    pub fn report(
        &mut self,
        engine: &str,
        width: u32,
        set: &CpuSet,
        hist: &Histogram,
    ) -> io::Result<()> {
        if !self.header_written {
            self.write_header(set)?;
            self.header_written = true;
        }

        for bucket in 1..width as usize {
            write!(self.out, "{} {}", engine, bucket)?;
            for cpu in set.iter() {
                write!(self.out, " {}", hist.row(cpu).count(bucket))?;
            }
            writeln!(self.out)?;
        }

        if self.flag_backwards {
            write!(self.out, "# {} backwards", engine)?;
            for cpu in set.iter() {
                write!(self.out, " {}", hist.row(cpu).backwards())?;
            }
            writeln!(self.out)?;
        }

        self.out.flush()
    }

    fn write_header(&mut self, set: &CpuSet) -> io::Result<()> {
        writeln!(self.out, "# hostname = {}", self.hostname)?;
        writeln!(self.out, "# nCPU     = {}", set.len())?;
        writeln!(self.out, "# tsc_sz   = {}", TABLE_WIDTH)?;
        writeln!(self.out, "# reps     = {}", self.reps)?;
        writeln!(self.out, "#-------------------------------------")?;
        write!(self.out, "engine clz")?;
        for cpu in set.iter() {
            write!(self.out, " cpu{:04}", cpu)?;
        }
        writeln!(self.out)
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

/// Returns this machine's host name as reported by `gethostname(2)`.
pub fn hostname() -> Result<String, Error> {
    let mut buf = [0u8; 1024];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len() - 1) };
    if ret != 0 {
        return Err(Error::Hostname(format!(
            "gethostname failed: {}",
            io::Error::last_os_error()
        )));
    }
    let name = CStr::from_bytes_until_nul(&buf)
        .map_err(|_| Error::Hostname("host name is not NUL-terminated".into()))?;
    Ok(name.to_string_lossy().into_owned())
}
