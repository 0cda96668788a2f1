//! Ways to make a process sad.
//!
//! Every function in here raises a fatal signal in the calling thread, and
//! only returns if that signal was somehow handled and execution resumed.

#![allow(unsafe_code)]

use std::arch::asm;

/// The address [`raise_segfault`] reads from, the first page is never mapped
pub const SEGFAULT_ADDRESS: usize = 0x42;

/// [`libc::SIGABRT`]
pub fn raise_abort() {
    std::process::abort();
}

/// [`libc::SIGSEGV`], `SEGV_MAPERR` at [`SEGFAULT_ADDRESS`]
///
/// # Safety
///
/// Not safe at all.
pub unsafe fn raise_segfault() {
    // A non-null address, dereferencing null would hit the debug assertions
    // for null pointers before ever faulting
    let byte = unsafe { std::ptr::read_volatile(SEGFAULT_ADDRESS as *const u8) };
    println!("we should have crashed reading {SEGFAULT_ADDRESS:#x}, got {byte}");
}

/// [`libc::SIGFPE`], `FPE_INTDIV` on `x86_64` where dividing by zero traps.
/// Other architectures don't trap on integer division, so the signal is sent
/// instead.
///
/// # Safety
///
/// Not safe at all.
pub unsafe fn raise_floating_point_exception() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            let quotient: u32;
            unsafe {
                asm!(
                    "mov eax, 1",
                    "cdq",
                    "mov {div:e}, 0",
                    "idiv {div:e}",
                    div = out(reg) _,
                    out("eax") quotient,
                    out("edx") _,
                );
            }
            println!("we should have crashed dividing by zero, got {quotient}");
        } else {
            unsafe {
                libc::raise(libc::SIGFPE);
            }
        }
    }
}

/// [`libc::SIGILL`]
///
/// # Safety
///
/// Not safe at all.
pub unsafe fn raise_illegal_instruction() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            unsafe { asm!("ud2") };
        } else if #[cfg(target_arch = "aarch64")] {
            unsafe { asm!("udf #0") };
        } else {
            unsafe { libc::raise(libc::SIGILL) };
        }
    }
}

/// [`libc::SIGBUS`], `BUS_ADRERR` by reading a mapping beyond the end of the
/// empty file at `path`
///
/// # Safety
///
/// Not safe at all.
pub unsafe fn raise_bus(path: &std::path::Path) {
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        eprintln!("invalid bus path {}", path.display());
        return;
    };

    unsafe {
        let bus_fd = libc::open(
            cpath.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
            0o666,
        );
        if bus_fd < 0 {
            eprintln!("failed to open {}", path.display());
            return;
        }

        let mapping = libc::mmap(
            std::ptr::null_mut(),
            128,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            bus_fd,
            0,
        );
        if mapping == libc::MAP_FAILED {
            eprintln!("failed to map {}", path.display());
            return;
        }

        let byte = std::ptr::read_volatile(mapping.cast::<u8>().add(1));
        println!("we should have crashed reading past the end of the file, got {byte}");
    }
}

/// [`libc::SIGTRAP`]
///
/// # Safety
///
/// Not safe at all.
pub unsafe fn raise_trap() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            unsafe { asm!("int3") };
        } else if #[cfg(target_arch = "aarch64")] {
            unsafe { asm!("brk #0") };
        } else {
            unsafe { libc::raise(libc::SIGTRAP) };
        }
    }
}

/// [`libc::SIGSEGV`], by overflowing the stack of the calling thread into its
/// guard page
pub fn raise_stack_overflow() {
    let mut big_boi = std::hint::black_box([0u8; 9 * 1024 * 1024]);
    big_boi[big_boi.len() - 1] = 1;
    println!("{:?}", &std::hint::black_box(big_boi)[big_boi.len() - 20..]);
}
