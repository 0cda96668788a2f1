//! Definitions of the machine context the kernel hands to an `SA_SIGINFO`
//! signal handler, laid out independently of the libc in use.
//!
//! The `ucontext_t` delivered to a signal handler only depends on the kernel
//! ABI of the target architecture, but the definitions in libc differ between
//! glibc and musl <https://github.com/rust-lang/libc/pull/1646>, so we define
//! the handful of structures we need to read registers from ourselves.

// crate-specific exceptions:
#![allow(unsafe_code, nonstandard_style)]

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;
        pub use linux::*;
    }
}
