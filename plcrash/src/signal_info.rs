//! Static mappings of signal numbers and `si_code` values to their names.
//!
//! Lookups are linear scans of small tables, which is fine as they are only
//! consulted a handful of times per crash report, and keeps them trivially
//! safe to call from a signal handler.

struct SignalName {
    signal: i32,
    name: &'static str,
}

struct SignalCode {
    signal: i32,
    code: i32,
    name: &'static str,
}

macro_rules! names {
    ($($sig:ident),+ $(,)?) => {
        &[$(SignalName { signal: libc::$sig, name: stringify!($sig) }),+]
    };
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        static SIGNAL_NAMES: &[SignalName] = names![
            SIGHUP, SIGINT, SIGQUIT, SIGILL, SIGTRAP, SIGABRT, SIGBUS, SIGFPE,
            SIGKILL, SIGUSR1, SIGSEGV, SIGUSR2, SIGPIPE, SIGALRM, SIGTERM,
            SIGSTKFLT, SIGCHLD, SIGCONT, SIGSTOP, SIGTSTP, SIGTTIN, SIGTTOU,
            SIGURG, SIGXCPU, SIGXFSZ, SIGVTALRM, SIGPROF, SIGWINCH, SIGIO,
            SIGPWR, SIGSYS,
        ];

        // We define the codes ourselves rather than use libc as they are
        // missing from eg. Android, values are from <asm-generic/siginfo.h>
        pub const SI_USER: i32 = 0;
        pub const SI_KERNEL: i32 = 0x80;
        pub const SI_QUEUE: i32 = -1;
        pub const SI_TIMER: i32 = -2;
        pub const SI_MESGQ: i32 = -3;
        pub const SI_ASYNCIO: i32 = -4;
        pub const SI_SIGIO: i32 = -5;
        pub const SI_TKILL: i32 = -6;

        pub const ILL_ILLOPC: i32 = 1;
        pub const ILL_ILLOPN: i32 = 2;
        pub const ILL_ILLADR: i32 = 3;
        pub const ILL_ILLTRP: i32 = 4;
        pub const ILL_PRVOPC: i32 = 5;
        pub const ILL_PRVREG: i32 = 6;
        pub const ILL_COPROC: i32 = 7;
        pub const ILL_BADSTK: i32 = 8;

        pub const FPE_INTDIV: i32 = 1;
        pub const FPE_INTOVF: i32 = 2;
        pub const FPE_FLTDIV: i32 = 3;
        pub const FPE_FLTOVF: i32 = 4;
        pub const FPE_FLTUND: i32 = 5;
        pub const FPE_FLTRES: i32 = 6;
        pub const FPE_FLTINV: i32 = 7;
        pub const FPE_FLTSUB: i32 = 8;

        pub const SEGV_MAPERR: i32 = 1;
        pub const SEGV_ACCERR: i32 = 2;
        pub const SEGV_BNDERR: i32 = 3;
        pub const SEGV_PKUERR: i32 = 4;

        pub const BUS_ADRALN: i32 = 1;
        pub const BUS_ADRERR: i32 = 2;
        pub const BUS_OBJERR: i32 = 3;
        pub const BUS_MCEERR_AR: i32 = 4;
        pub const BUS_MCEERR_AO: i32 = 5;

        pub const TRAP_BRKPT: i32 = 1;
        pub const TRAP_TRACE: i32 = 2;
        pub const TRAP_BRANCH: i32 = 3;
        pub const TRAP_HWBKPT: i32 = 4;

        macro_rules! codes {
            ($($sig:ident => [$($code:ident),+ $(,)?]),+ $(,)?) => {
                &[$($(SignalCode { signal: libc::$sig, code: $code, name: stringify!($code) }),+),+]
            };
        }

        static SIGNAL_CODES: &[SignalCode] = codes![
            SIGILL => [
                ILL_ILLOPC, ILL_ILLOPN, ILL_ILLADR, ILL_ILLTRP, ILL_PRVOPC,
                ILL_PRVREG, ILL_COPROC, ILL_BADSTK,
            ],
            SIGFPE => [
                FPE_INTDIV, FPE_INTOVF, FPE_FLTDIV, FPE_FLTOVF, FPE_FLTUND,
                FPE_FLTRES, FPE_FLTINV, FPE_FLTSUB,
            ],
            SIGSEGV => [SEGV_MAPERR, SEGV_ACCERR, SEGV_BNDERR, SEGV_PKUERR],
            SIGBUS => [BUS_ADRALN, BUS_ADRERR, BUS_OBJERR, BUS_MCEERR_AR, BUS_MCEERR_AO],
            SIGTRAP => [TRAP_BRKPT, TRAP_TRACE, TRAP_BRANCH, TRAP_HWBKPT],
        ];

        /// Codes describing who sent a signal, which apply to every signal
        static SENDER_CODES: &[SignalName] = &[
            SignalName { signal: SI_USER, name: "SI_USER" },
            SignalName { signal: SI_KERNEL, name: "SI_KERNEL" },
            SignalName { signal: SI_QUEUE, name: "SI_QUEUE" },
            SignalName { signal: SI_TIMER, name: "SI_TIMER" },
            SignalName { signal: SI_MESGQ, name: "SI_MESGQ" },
            SignalName { signal: SI_ASYNCIO, name: "SI_ASYNCIO" },
            SignalName { signal: SI_SIGIO, name: "SI_SIGIO" },
            SignalName { signal: SI_TKILL, name: "SI_TKILL" },
        ];
    } else {
        static SIGNAL_NAMES: &[SignalName] = names![
            SIGHUP, SIGINT, SIGQUIT, SIGILL, SIGTRAP, SIGABRT, SIGBUS, SIGFPE,
            SIGKILL, SIGUSR1, SIGSEGV, SIGUSR2, SIGPIPE, SIGALRM, SIGTERM,
            SIGCHLD, SIGCONT, SIGSTOP, SIGTSTP, SIGTTIN, SIGTTOU, SIGURG,
            SIGXCPU, SIGXFSZ, SIGVTALRM, SIGPROF, SIGWINCH, SIGIO, SIGSYS,
        ];

        static SIGNAL_CODES: &[SignalCode] = &[];
        static SENDER_CODES: &[SignalName] = &[];
    }
}

/// Maps a signal number to its `SIG*` name
pub fn signal_name(signal: i32) -> Option<&'static str> {
    SIGNAL_NAMES
        .iter()
        .find(|sn| sn.signal == signal)
        .map(|sn| sn.name)
}

/// Maps a signal's `si_code` to its name.
///
/// Codes specific to the signal take precedence over the generic codes that
/// describe the sender of the signal, eg. `SI_USER` for a signal sent via
/// `kill(2)`.
pub fn signal_code_name(signal: i32, code: i32) -> Option<&'static str> {
    SIGNAL_CODES
        .iter()
        .find(|sc| sc.signal == signal && sc.code == code)
        .map(|sc| sc.name)
        .or_else(|| {
            SENDER_CODES
                .iter()
                .find(|sc| sc.signal == code)
                .map(|sc| sc.name)
        })
}
