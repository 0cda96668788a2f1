use super::{Backend, FloatReg, Frame, FrameError, RegNum, Word};
use plcrash_context as ctx;

/// Register numbers understood by [`super::Cursor::register`], `x0` through
/// `x28` are simply `0..=28`
pub mod regs {
    use super::RegNum;

    pub const X0: RegNum = 0;
    pub const FP: RegNum = 29;
    pub const LR: RegNum = 30;
    pub const SP: RegNum = 31;
    pub const PC: RegNum = 32;
    pub const CPSR: RegNum = 33;

    /// `v0` through `v31`
    pub const V0: RegNum = 0;
}

const NAMES: [&str; 34] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "fp", "lr", "sp", "pc", "cpsr",
];

pub struct Aarch64;

impl Backend for Aarch64 {
    const REG_IP: RegNum = regs::PC;
    const REG_FP: RegNum = regs::FP;
    const REG_SP: RegNum = regs::SP;
    const REG_COUNT: RegNum = NAMES.len() as RegNum;
    const FLOAT_REG_COUNT: RegNum = 32;

    #[inline]
    fn init(context: &ctx::ucontext_t) -> Result<Frame, FrameError> {
        Ok(context.frame())
    }

    fn context_register(context: &ctx::ucontext_t, reg: RegNum) -> Word {
        let mcontext = &context.uc_mcontext;
        let value = match reg {
            regs::SP => mcontext.sp,
            regs::PC => mcontext.pc,
            regs::CPSR => mcontext.pstate,
            // x0-x28, fp and lr
            general => mcontext.regs[general as usize],
        };
        value as Word
    }

    fn context_float_register(context: &ctx::ucontext_t, reg: RegNum) -> Option<FloatReg> {
        context
            .uc_mcontext
            .fpsimd()
            .map(|fpsimd| fpsimd.vregs[reg as usize])
    }

    #[inline]
    fn register_name(reg: RegNum) -> Option<&'static str> {
        NAMES.get(reg as usize).copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::Cursor;

    #[test]
    fn reads_general_registers() {
        let mut context = ctx::ucontext_t::from_frame(Default::default());
        for (i, reg) in context.uc_mcontext.regs.iter_mut().enumerate() {
            *reg = 0x100 + i as u64;
        }
        context.uc_mcontext.sp = 0x2000;
        context.uc_mcontext.pc = 0x3000;
        context.uc_mcontext.pstate = 0x6000_0000;

        let cursor = Cursor::<Aarch64>::new(&context).unwrap();
        assert_eq!(cursor.register(regs::X0).unwrap(), 0x100);
        assert_eq!(cursor.register(28).unwrap(), 0x100 + 28);
        assert_eq!(cursor.register(regs::LR).unwrap(), 0x100 + 30);
        assert_eq!(cursor.register(regs::SP).unwrap(), 0x2000);
        assert_eq!(cursor.register(regs::PC).unwrap(), 0x3000);
        assert_eq!(cursor.register(regs::CPSR).unwrap(), 0x6000_0000);
        assert_eq!(Aarch64::register_name(regs::LR), Some("lr"));
    }

    #[test]
    fn reads_vector_registers() {
        let mut context = ctx::ucontext_t::from_frame(Default::default());
        let reserved = &mut context.uc_mcontext.__reserved.0;
        reserved[0..4].copy_from_slice(&ctx::FPSIMD_MAGIC.to_ne_bytes());
        reserved[4..8]
            .copy_from_slice(&(std::mem::size_of::<ctx::fpsimd_context>() as u32).to_ne_bytes());
        // v31 is the last 16 bytes of the record
        let v31 = 16 + 31 * 16;
        reserved[v31..v31 + 16].copy_from_slice(&7u128.to_ne_bytes());

        let cursor = Cursor::<Aarch64>::new(&context).unwrap();
        assert_eq!(cursor.float_register(regs::V0).unwrap(), 0);
        assert_eq!(cursor.float_register(31).unwrap(), 7);
    }
}
