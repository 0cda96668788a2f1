use super::{Backend, FloatReg, Frame, FrameError, RegNum, Word};
use plcrash_context::ucontext_t;

/// The backend for architectures the frame walker doesn't support, every
/// operation fails with [`FrameError::NotSupported`]
pub struct Unsupported;

impl Backend for Unsupported {
    const REG_IP: RegNum = 0;
    const REG_FP: RegNum = 1;
    const REG_SP: RegNum = 2;
    const REG_COUNT: RegNum = 3;
    const FLOAT_REG_COUNT: RegNum = 0;

    #[inline]
    fn init(_context: &ucontext_t) -> Result<Frame, FrameError> {
        Err(FrameError::NotSupported)
    }

    #[inline]
    fn context_register(_context: &ucontext_t, _reg: RegNum) -> Word {
        0
    }

    #[inline]
    fn context_float_register(_context: &ucontext_t, _reg: RegNum) -> Option<FloatReg> {
        None
    }

    #[inline]
    fn register_name(reg: RegNum) -> Option<&'static str> {
        ["ip", "fp", "sp"].get(reg as usize).copied()
    }

    #[inline]
    fn next(_frame: &Frame, _stack: &super::StackRange) -> Result<Frame, FrameError> {
        Err(FrameError::NotSupported)
    }
}
