use super::{Signal, capture::SignalDetails};
use crate::Error;
use std::{
    mem, ptr,
    sync::atomic::{AtomicBool, Ordering},
};

/// The smallest alternate stack we are willing to run on
const MIN_STACK_SIZE: usize = 64 * 1024;

// std::cmp::max is not const :(
const fn get_stack_size() -> usize {
    if libc::SIGSTKSZ > MIN_STACK_SIZE {
        libc::SIGSTKSZ
    } else {
        MIN_STACK_SIZE
    }
}

/// The size of the alternate stack that is mapped for a thread.
///
/// The report is written entirely on this stack, including the walked frames
/// and the buffers used to read the mapped images. The memory is only
/// committed in case we actually crash.
const SIG_STACK_SIZE: usize = get_stack_size();

/// Create an alternative stack to run the signal handler on for the calling
/// thread. This is done since the signal might have been caused by a stack
/// overflow.
///
/// An existing alternate stack is reused if it is large enough. The mapping
/// is never freed, so this should only be called once per thread.
pub fn install_sigaltstack() -> Result<(), Error> {
    // SAFETY: syscalls
    unsafe {
        // Check to see if the existing sigaltstack, and if it exists, is it big
        // enough. If so we don't need to allocate our own.
        let mut old_stack: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut old_stack) == -1 {
            return Err(std::io::Error::last_os_error().into());
        }

        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIG_STACK_SIZE {
            return Ok(());
        }

        // ... but failing that we need to allocate our own, so do all that
        // here, with a guard page below the stack so that overflowing it
        // faults instead of scribbling over whatever is mapped there
        let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let alloc_size = guard_size + SIG_STACK_SIZE;

        let map = libc::mmap(
            ptr::null_mut(),
            alloc_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if map == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }

        let unmap = |err: std::io::Error| {
            libc::munmap(map, alloc_size);
            Error::Io(err)
        };

        // Prepare the stack with readable/writable memory and then register it
        // with `sigaltstack`.
        let stack_ptr = (map as usize + guard_size) as *mut libc::c_void;
        if libc::mprotect(
            stack_ptr,
            SIG_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
        ) == -1
        {
            return Err(unmap(std::io::Error::last_os_error()));
        }

        let new_stack = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: SIG_STACK_SIZE,
        };
        if libc::sigaltstack(&new_stack, ptr::null_mut()) == -1 {
            return Err(unmap(std::io::Error::last_os_error()));
        }

        Ok(())
    }
}

/// Restores the signal handler for the specified signal back to its default
/// handler, which _should_ perform the default signal action as seen in
/// <https://man7.org/linux/man-pages/man7/signal.7.html>
#[inline]
unsafe fn install_default_handler(sig: i32) {
    // Android L+ expose signal and sigaction symbols that override the system
    // ones. There is a bug in these functions where a request to set the handler
    // to SIG_DFL is ignored. In that case, an infinite loop is entered as the
    // signal is repeatedly sent to our signal handler.
    // To work around this, directly call the system's sigaction.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                let mut sa: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut sa.sa_mask);
                sa.sa_sigaction = libc::SIG_DFL;
                sa.sa_flags = libc::SA_RESTART;
                libc::syscall(
                    libc::SYS_rt_sigaction,
                    sig,
                    &sa,
                    ptr::null::<libc::sigaction>(),
                    mem::size_of::<libc::sigset_t>(),
                );
            } else {
                libc::signal(sig, libc::SIG_DFL);
            }
        }
    }
}

/// Installs [`signal_handler`] for every [`Signal`].
///
/// If any of them fails, the handlers that were already replaced are restored
/// to what they were before.
pub unsafe fn install_handlers() -> Result<(), Error> {
    unsafe {
        let mut old_handlers: [libc::sigaction; Signal::ALL.len()] = mem::zeroed();

        for (sig, old) in Signal::ALL.iter().zip(old_handlers.iter_mut()) {
            if libc::sigaction(*sig as i32, ptr::null(), old) == -1 {
                return Err(std::io::Error::last_os_error().into());
            }
        }

        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        // Mask all exception signals when we're handling one of them.
        for sig in Signal::ALL {
            libc::sigaddset(&mut sa.sa_mask, sig as i32);
        }

        sa.sa_sigaction = signal_handler as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

        for (i, sig) in Signal::ALL.iter().enumerate() {
            if libc::sigaction(*sig as i32, &sa, ptr::null_mut()) == -1 {
                let err = std::io::Error::last_os_error();

                for (sig, old) in Signal::ALL.iter().zip(old_handlers.iter()).take(i) {
                    if libc::sigaction(*sig as i32, old, ptr::null_mut()) == -1 {
                        install_default_handler(*sig as i32);
                    }
                }

                log::error!("failed to install handler for {}: {err}", sig.name());
                return Err(err.into());
            }
        }

        Ok(())
    }
}

/// Set while a report is being written, so that only one is ever written at a
/// time
static CAPTURING: AtomicBool = AtomicBool::new(false);

/// Runs `f` if no other report is currently being written, used when writing
/// a report outside of a real crash
pub(super) fn with_capture_guard(f: impl FnOnce() -> Result<(), Error>) -> Result<(), Error> {
    if CAPTURING.swap(true, Ordering::AcqRel) {
        return Err(Error::Output);
    }

    let res = f();
    CAPTURING.store(false, Ordering::Release);
    res
}

/// Waits for the report currently being written to finish. After a crash the
/// process is killed once it is, so this only returns if the report was a
/// test report, or if writing it got stuck for several seconds
fn wait_for_capture() {
    let pause = libc::timespec {
        tv_sec: 0,
        tv_nsec: 10_000_000,
    };

    for _ in 0..500 {
        if !CAPTURING.load(Ordering::Acquire) {
            return;
        }

        // SAFETY: syscall
        unsafe { libc::nanosleep(&pause, ptr::null_mut()) };
    }
}

/// This is the actual function installed for each signal we support, invoked
/// by the kernel
unsafe extern "C" fn signal_handler(
    sig: i32,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        // We might run inside a process where some other buggy code saves and
        // restores signal handlers temporarily with `signal` instead of `sigaction`.
        // This loses the `SA_SIGINFO` flag associated with this function. As a
        // consequence, the values of `info` and `uc` become totally bogus,
        // generally inducing a crash.
        //
        // The following code tries to detect this case. When it does, it
        // resets the signal handlers with `sigaction` & `SA_SIGINFO` and returns.
        // This forces the signal to be thrown again, but this time the kernel
        // will call the function with the right arguments.
        {
            let mut cur_handler: libc::sigaction = mem::zeroed();
            if libc::sigaction(sig, ptr::null_mut(), &mut cur_handler) == 0
                && cur_handler.sa_sigaction == signal_handler as usize
                && cur_handler.sa_flags & libc::SA_SIGINFO == 0
            {
                // Reset signal handler with the correct flags.
                libc::sigemptyset(&mut cur_handler.sa_mask);
                libc::sigaddset(&mut cur_handler.sa_mask, sig);

                cur_handler.sa_sigaction = signal_handler as usize;
                cur_handler.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

                if libc::sigaction(sig, &cur_handler, ptr::null_mut()) == -1 {
                    // When resetting the handler fails, try to reset the
                    // default one to avoid an infinite loop here.
                    install_default_handler(sig);
                }

                // exit the handler as we should be called again soon
                return;
            }
        }

        let mut acquired = !CAPTURING.swap(true, Ordering::AcqRel);
        if !acquired {
            debug_print!("another thread is capturing a crash report");
            wait_for_capture();
            acquired = !CAPTURING.swap(true, Ordering::AcqRel);
        }

        if acquired {
            debug_print!("capturing crash report");

            if let (Some(capture), Some(info), Some(uc)) = (
                super::shared_handler().capture_state(),
                info.as_ref(),
                uc.cast::<plcrash_context::ucontext_t>().as_ref(),
            ) {
                let details = SignalDetails::from_siginfo(sig, info);
                match capture.write_report(&details, uc) {
                    Ok(()) => {
                        debug_print!("crash report written");
                    }
                    Err(_err) => {
                        debug_print!("failed to write crash report");
                    }
                }
            }
        }

        // Whether the capture worked or not, the process needs to die with
        // the original signal, so that eg. the exit status or a core dump is
        // the same as if we had never been installed
        install_default_handler(sig);

        debug_print!("re-raising signal");

        // Faults would be raised again when returning, but not signals that
        // were sent, nor traps, so just send it to ourselves in all cases, it
        // will be delivered once this handler returns and unmasks it
        let tid = libc::syscall(libc::SYS_gettid) as i32;
        if libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, sig) < 0 {
            // If we failed to kill ourselves (e.g. because a sandbox disallows us
            // to do so), we instead resort to terminating our process. This will
            // result in an incorrect exit code.
            libc::_exit(1);
        }
    }
}
