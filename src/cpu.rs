//! CPU topology and pinning helpers.
//!
//! Workers pin themselves to the `i`-th CPU of the process affinity mask,
//! so `taskset(1)` controls which CPUs a run may use and the thread index
//! controls placement within that set.

use std::io;
use std::mem;

/// Polite spin-wait hint for contended loops.
///
/// Compiles to `pause` on x86-64 and `yield` on aarch64.
#[inline(always)]
pub fn cpu_relax() {
    std::hint::spin_loop();
}

/// Returns the CPUs in this process's affinity mask, in ascending order.
pub fn process_cpus() -> io::Result<Vec<usize>> {
    // SAFETY: zeroed cpu_set_t is a valid (empty) set; sched_getaffinity
    // writes at most size_of::<cpu_set_t>() bytes into it.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect())
    }
}

/// Restricts the calling thread to exactly one CPU.
pub fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    // SAFETY: the set is zero-initialized before CPU_SET, and cpu is
    // bounds-checked against CPU_SETSIZE below.
    unsafe {
        if cpu >= libc::CPU_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cpu {cpu} exceeds CPU_SETSIZE"),
            ));
        }
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{pin_to_cpu, process_cpus};

    #[test]
    fn mask_is_nonempty_and_sorted() {
        let cpus = process_cpus().unwrap();
        assert!(!cpus.is_empty());
        assert!(cpus.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn pin_to_first_allowed_cpu() {
        let cpus = process_cpus().unwrap();
        pin_to_cpu(cpus[0]).unwrap();
        // The mask should now contain only that CPU.
        assert_eq!(process_cpus().unwrap(), vec![cpus[0]]);
    }

    #[test]
    fn pin_rejects_absurd_cpu() {
        assert!(pin_to_cpu(usize::MAX).is_err());
    }
}
