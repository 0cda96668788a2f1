//! Walks the stack of a thread from the machine context delivered to a signal
//! handler, using nothing but raw memory reads.
//!
//! Only the frame pointer convention is supported: at the address held in the
//! frame pointer register the caller's saved frame pointer is stored, followed
//! by the return address into the caller. This requires the code being walked
//! to be compiled with frame pointers (eg. `-C force-frame-pointers=yes`), the
//! walk ends with [`FrameError::BadFrame`] as soon as it reaches code that
//! isn't.
//!
//! ```no_run
//! use plcrash::frame::{Cursor, FrameError, REG_IP};
//!
//! fn walk(context: &plcrash::ucontext_t) -> Result<(), FrameError> {
//!     let mut cursor: Cursor = Cursor::new(context)?;
//!     loop {
//!         println!("{:#x}", cursor.register(REG_IP)?);
//!         match cursor.next() {
//!             Ok(()) => continue,
//!             Err(FrameError::NoFrame) => return Ok(()),
//!             Err(e) => return Err(e),
//!         }
//!     }
//! }
//! ```

use plcrash_context::ucontext_t;
use std::{fmt, marker::PhantomData, mem::size_of};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{X86_64 as Native, regs};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{Aarch64 as Native, regs};
    } else {
        pub use unsupported::Unsupported as Native;
    }
}

mod unsupported;

pub use plcrash_context::FrameRegisters as Frame;
pub use unsupported::Unsupported;

/// A machine word, the unit frame records are made of
pub type Word = usize;
/// A register number, see the `regs` module of the native backend
pub type RegNum = u32;
/// The value of a floating point or vector register
pub type FloatReg = u128;

pub const WORD_SIZE: usize = size_of::<Word>();

/// The instruction pointer register of the native backend, every backend
/// exposes one.
pub const REG_IP: RegNum = Native::REG_IP;

/// How far above the faulting stack pointer frame records are looked for
pub const MAX_STACK_SPAN: usize = 256 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// An unknown error occurred
    Unknown,
    /// There are no more frames, the walk has finished normally
    NoFrame,
    /// The frame data is present but invalid, or unreadable
    BadFrame,
    /// The operation is not supported by the backend, or for the frame
    NotSupported,
    /// An invalid argument was supplied
    InvalidArgument,
    /// The register number is not valid for the backend
    BadRegister,
}

impl FrameError {
    /// A static description of the error, usable within a signal handler
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown error",
            Self::NoFrame => "no more frames",
            Self::BadFrame => "corrupted frame",
            Self::NotSupported => "operation not supported",
            Self::InvalidArgument => "invalid argument",
            Self::BadRegister => "invalid register",
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for FrameError {}

/// The range of addresses frame records may be read from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StackRange {
    /// The lowest valid address, inclusive
    pub low: usize,
    /// The highest valid address, exclusive
    pub high: usize,
}

impl StackRange {
    #[inline]
    pub const fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    /// The range for a thread whose stack pointer is `sp`.
    ///
    /// The stack grows down, so every caller's frame lives above the stack
    /// pointer of the innermost frame.
    #[inline]
    pub const fn from_stack_pointer(sp: usize) -> Self {
        Self {
            low: sp,
            high: sp.saturating_add(MAX_STACK_SPAN),
        }
    }

    /// Checks that a frame record at `addr` is word aligned and lies entirely
    /// within the range
    #[inline]
    pub fn contains_frame(&self, addr: usize) -> bool {
        addr % WORD_SIZE == 0
            && addr >= self.low
            && addr
                .checked_add(2 * WORD_SIZE)
                .is_some_and(|end| end <= self.high)
    }
}

/// The per-architecture half of the frame walker
pub trait Backend {
    /// The instruction pointer
    const REG_IP: RegNum;
    /// The frame pointer
    const REG_FP: RegNum;
    /// The stack pointer
    const REG_SP: RegNum;
    /// The number of general purpose registers, register numbers are
    /// `0..REG_COUNT`
    const REG_COUNT: RegNum;
    /// The number of floating point registers
    const FLOAT_REG_COUNT: RegNum;

    /// Validates the context and retrieves the frame that was executing when
    /// it was captured
    fn init(context: &ucontext_t) -> Result<Frame, FrameError>;

    /// Reads a general purpose register, `reg` is always `< REG_COUNT`
    fn context_register(context: &ucontext_t, reg: RegNum) -> Word;

    /// Reads a floating point register, `reg` is always `< FLOAT_REG_COUNT`.
    ///
    /// Returns `None` if the context doesn't carry floating point state.
    fn context_float_register(context: &ucontext_t, reg: RegNum) -> Option<FloatReg>;

    /// The conventional name of a general purpose register
    fn register_name(reg: RegNum) -> Option<&'static str>;

    /// Finds the caller of `frame`
    #[inline]
    fn next(frame: &Frame, stack: &StackRange) -> Result<Frame, FrameError> {
        next_frame_pointer(frame, stack)
    }
}

/// Follows the frame record `frame.fp` points to.
///
/// The saved frame pointer that is loaded is validated here, before the next
/// step dereferences it, so a corrupted chain is reported at the frame that
/// corrupted it.
pub fn next_frame_pointer(frame: &Frame, stack: &StackRange) -> Result<Frame, FrameError> {
    let fp = frame.fp;
    if fp == 0 {
        return Err(FrameError::NoFrame);
    }

    if !stack.contains_frame(fp) {
        return Err(FrameError::BadFrame);
    }

    let [saved_fp, return_address] = read_frame_record(fp)?;

    if return_address == 0 {
        return Err(FrameError::NoFrame);
    }

    // The outermost frame has a null saved frame pointer, which ends the walk
    // on the next step, anything else has to be a valid record further up the
    // stack, or we would loop forever
    if saved_fp != 0 && (saved_fp <= fp || !stack.contains_frame(saved_fp)) {
        return Err(FrameError::BadFrame);
    }

    Ok(Frame {
        ip: return_address,
        sp: fp + 2 * WORD_SIZE,
        fp: saved_fp,
    })
}

/// Reads the two words of a frame record.
///
/// The read goes through `process_vm_readv` on our own process, so that a
/// record on an unmapped page fails with `EFAULT` rather than faulting again
/// inside the signal handler.
pub(crate) fn read_frame_record(addr: usize) -> Result<[Word; 2], FrameError> {
    let mut record = [0 as Word; 2];
    let len = std::mem::size_of_val(&record);

    let local = libc::iovec {
        iov_base: record.as_mut_ptr().cast(),
        iov_len: len,
    };
    let remote = libc::iovec {
        iov_base: addr as *mut libc::c_void,
        iov_len: len,
    };

    // The arguments are variadic, so every one of them has to be passed at
    // the full width the kernel reads them at
    // SAFETY: syscall, the local iovec points to our record
    let read = unsafe {
        libc::syscall(
            libc::SYS_process_vm_readv,
            libc::getpid() as libc::c_long,
            &local as *const libc::iovec,
            1 as libc::c_ulong,
            &remote as *const libc::iovec,
            1 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };

    if read == len as libc::c_long {
        return Ok(record);
    }

    if read < 0 {
        // Creating an io::Error from an OS error doesn't allocate
        match std::io::Error::last_os_error().raw_os_error() {
            // The syscall is unavailable, eg. blocked by seccomp
            Some(libc::ENOSYS | libc::EPERM) => return read_through_pipe(addr),
            _ => {}
        }
    }

    Err(FrameError::BadFrame)
}

/// Reads a frame record by writing it through a pipe, the kernel checks the
/// source of a `write` so an unmapped address fails with `EFAULT` instead of
/// faulting
pub(crate) fn read_through_pipe(addr: usize) -> Result<[Word; 2], FrameError> {
    let mut fds = [-1; 2];

    // SAFETY: syscall
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(FrameError::BadFrame);
    }

    let mut record = [0 as Word; 2];
    let len = std::mem::size_of_val(&record) as isize;

    // SAFETY: syscalls, the record is large enough for what is written
    unsafe {
        let res = if libc::write(fds[1], addr as *const libc::c_void, len as usize) == len
            && libc::read(fds[0], record.as_mut_ptr().cast(), len as usize) == len
        {
            Ok(record)
        } else {
            Err(FrameError::BadFrame)
        };

        libc::close(fds[0]);
        libc::close(fds[1]);
        res
    }
}

/// The instruction pointers of a walked stack, innermost first.
///
/// The frames are held inline, so a walk can be recorded from within a signal
/// handler and then read as many times as needed.
pub struct StackTrace<const N: usize> {
    frames: [Word; N],
    len: usize,
    error: Option<FrameError>,
    truncated: bool,
}

impl<const N: usize> StackTrace<N> {
    /// Records the frame the cursor is on and each of its callers, up to `N`
    /// frames
    pub fn walk<B: Backend>(cursor: &mut Cursor<'_, B>) -> Self {
        let mut trace = Self::failed(None);

        while trace.len < N {
            match cursor.register(B::REG_IP) {
                Ok(ip) => {
                    trace.frames[trace.len] = ip;
                    trace.len += 1;
                }
                Err(err) => {
                    trace.error = Some(err);
                    return trace;
                }
            }

            match cursor.next() {
                Ok(()) => {}
                Err(FrameError::NoFrame) => return trace,
                Err(err) => {
                    trace.error = Some(err);
                    return trace;
                }
            }
        }

        // The cursor is on a caller there was no room for
        trace.truncated = true;
        trace
    }

    /// A trace without any frames, for when no cursor could be created
    #[inline]
    pub fn failed(error: Option<FrameError>) -> Self {
        Self {
            frames: [0; N],
            len: 0,
            error,
            truncated: false,
        }
    }

    #[inline]
    pub fn frames(&self) -> &[Word] {
        &self.frames[..self.len]
    }

    /// Why the walk ended before reaching the outermost frame, if it did
    #[inline]
    pub fn error(&self) -> Option<FrameError> {
        self.error
    }

    /// True if the walk stopped because there were more than `N` frames
    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// A position in the call stack of a thread.
///
/// The cursor starts on the frame that was executing when the context was
/// captured, and moves to its caller on each [`Self::next`] call.
pub struct Cursor<'a, B: Backend = Native> {
    context: &'a ucontext_t,
    stack: StackRange,
    frame: Frame,
    init_frame: bool,
    _backend: PhantomData<B>,
}

impl<'a, B: Backend> Cursor<'a, B> {
    /// Creates a cursor positioned on the frame that was executing when the
    /// context was captured.
    ///
    /// Callers are searched for in the [`MAX_STACK_SPAN`] bytes above the
    /// context's stack pointer.
    pub fn new(context: &'a ucontext_t) -> Result<Self, FrameError> {
        let frame = B::init(context)?;
        Ok(Self::with_frame(context, frame, StackRange::from_stack_pointer(frame.sp)))
    }

    /// Creates a cursor that only reads frame records from `stack`
    pub fn with_stack_range(context: &'a ucontext_t, stack: StackRange) -> Result<Self, FrameError> {
        let frame = B::init(context)?;
        Ok(Self::with_frame(context, frame, stack))
    }

    /// Creates a cursor from the raw context pointer passed to an
    /// `SA_SIGINFO` signal handler.
    ///
    /// # Safety
    ///
    /// `context` must either be null or point to a valid context that outlives
    /// the cursor.
    pub unsafe fn from_raw(context: *const ucontext_t) -> Result<Self, FrameError> {
        // SAFETY: the caller guarantees the pointer is valid if not null
        match unsafe { context.as_ref() } {
            Some(context) => Self::new(context),
            None => Err(FrameError::InvalidArgument),
        }
    }

    #[inline]
    fn with_frame(context: &'a ucontext_t, frame: Frame, stack: StackRange) -> Self {
        Self {
            context,
            stack,
            frame,
            init_frame: true,
            _backend: PhantomData,
        }
    }

    /// Moves to the caller of the current frame.
    ///
    /// [`FrameError::NoFrame`] means the walk finished normally, any other
    /// error that the frame chain is corrupted. Either way the cursor stays on
    /// the current frame.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<(), FrameError> {
        self.frame = B::next(&self.frame, &self.stack)?;
        self.init_frame = false;
        Ok(())
    }

    /// Reads a general purpose register of the current frame.
    ///
    /// Every register is available on the initial frame, on the frames of its
    /// callers only the instruction, stack and frame pointers can be
    /// recovered.
    pub fn register(&self, reg: RegNum) -> Result<Word, FrameError> {
        if reg >= B::REG_COUNT {
            return Err(FrameError::BadRegister);
        }

        if self.init_frame {
            Ok(B::context_register(self.context, reg))
        } else if reg == B::REG_IP {
            Ok(self.frame.ip)
        } else if reg == B::REG_SP {
            Ok(self.frame.sp)
        } else if reg == B::REG_FP {
            Ok(self.frame.fp)
        } else {
            Err(FrameError::NotSupported)
        }
    }

    /// Reads a floating point register of the current frame, these are only
    /// available on the initial frame
    pub fn float_register(&self, reg: RegNum) -> Result<FloatReg, FrameError> {
        if reg >= B::FLOAT_REG_COUNT {
            return Err(FrameError::BadRegister);
        }

        if !self.init_frame {
            return Err(FrameError::NotSupported);
        }

        B::context_float_register(self.context, reg).ok_or(FrameError::NotSupported)
    }

    /// True if the cursor is on the frame the context was captured in
    #[inline]
    pub fn is_initial_frame(&self) -> bool {
        self.init_frame
    }

    #[inline]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    #[inline]
    pub fn stack(&self) -> StackRange {
        self.stack
    }

    #[inline]
    pub fn context(&self) -> &'a ucontext_t {
        self.context
    }
}
