//! Reads the registers needed to walk the stack from the current location.
//!
//! This is not a full `getcontext`, which is not available on every libc
//! (notably musl, as it has been deprecated from POSIX for over a decade), we
//! only need a starting point for a frame walk when synthesizing a report.

/// The instruction, stack, and frame pointer of a single frame
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameRegisters {
    pub ip: usize,
    pub sp: usize,
    pub fp: usize,
}

/// Retrieves the registers of the frame this is inlined into.
///
/// Note that the frame pointer is only meaningful if the calling code was
/// compiled with frame pointers.
#[inline(always)]
pub fn current_frame() -> FrameRegisters {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            let (ip, sp, fp): (usize, usize, usize);
            // SAFETY: only reads registers
            unsafe {
                std::arch::asm!(
                    "lea {ip}, [rip]",
                    "mov {sp}, rsp",
                    "mov {fp}, rbp",
                    ip = out(reg) ip,
                    sp = out(reg) sp,
                    fp = out(reg) fp,
                    options(nomem, nostack, preserves_flags),
                );
            }
            FrameRegisters { ip, sp, fp }
        } else if #[cfg(target_arch = "aarch64")] {
            let (ip, sp, fp): (usize, usize, usize);
            // SAFETY: only reads registers
            unsafe {
                std::arch::asm!(
                    "adr {ip}, .",
                    "mov {sp}, sp",
                    "mov {fp}, x29",
                    ip = out(reg) ip,
                    sp = out(reg) sp,
                    fp = out(reg) fp,
                    options(nomem, nostack, preserves_flags),
                );
            }
            FrameRegisters { ip, sp, fp }
        } else {
            FrameRegisters::default()
        }
    }
}

#[cfg(test)]
mod test {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn reads_current_frame() {
        let local = 0u64;
        let frame = super::current_frame();

        assert_ne!(frame.ip, 0);
        // The stack pointer must be below (or at) anything on our stack
        assert!(frame.sp <= std::ptr::addr_of!(local) as usize);
    }
}
