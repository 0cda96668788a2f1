use super::{Backend, FloatReg, Frame, FrameError, RegNum, Word};
use plcrash_context as ctx;

/// Register numbers understood by [`super::Cursor::register`]
pub mod regs {
    use super::RegNum;

    pub const RAX: RegNum = 0;
    pub const RBX: RegNum = 1;
    pub const RCX: RegNum = 2;
    pub const RDX: RegNum = 3;
    pub const RDI: RegNum = 4;
    pub const RSI: RegNum = 5;
    pub const RBP: RegNum = 6;
    pub const RSP: RegNum = 7;
    pub const R8: RegNum = 8;
    pub const R9: RegNum = 9;
    pub const R10: RegNum = 10;
    pub const R11: RegNum = 11;
    pub const R12: RegNum = 12;
    pub const R13: RegNum = 13;
    pub const R14: RegNum = 14;
    pub const R15: RegNum = 15;
    pub const RIP: RegNum = 16;
    pub const RFLAGS: RegNum = 17;

    /// `xmm0` through `xmm15`
    pub const XMM0: RegNum = 0;
}

/// Our register number -> (name, index into `gregs`)
const GREGS: [(&str, usize); 18] = [
    ("rax", ctx::REG_RAX),
    ("rbx", ctx::REG_RBX),
    ("rcx", ctx::REG_RCX),
    ("rdx", ctx::REG_RDX),
    ("rdi", ctx::REG_RDI),
    ("rsi", ctx::REG_RSI),
    ("rbp", ctx::REG_RBP),
    ("rsp", ctx::REG_RSP),
    ("r8", ctx::REG_R8),
    ("r9", ctx::REG_R9),
    ("r10", ctx::REG_R10),
    ("r11", ctx::REG_R11),
    ("r12", ctx::REG_R12),
    ("r13", ctx::REG_R13),
    ("r14", ctx::REG_R14),
    ("r15", ctx::REG_R15),
    ("rip", ctx::REG_RIP),
    ("rflags", ctx::REG_EFL),
];

pub struct X86_64;

impl Backend for X86_64 {
    const REG_IP: RegNum = regs::RIP;
    const REG_FP: RegNum = regs::RBP;
    const REG_SP: RegNum = regs::RSP;
    const REG_COUNT: RegNum = GREGS.len() as RegNum;
    const FLOAT_REG_COUNT: RegNum = 16;

    #[inline]
    fn init(context: &ctx::ucontext_t) -> Result<Frame, FrameError> {
        Ok(context.frame())
    }

    #[inline]
    fn context_register(context: &ctx::ucontext_t, reg: RegNum) -> Word {
        context.uc_mcontext.gregs[GREGS[reg as usize].1] as Word
    }

    fn context_float_register(context: &ctx::ucontext_t, reg: RegNum) -> Option<FloatReg> {
        // SAFETY: when not null, the kernel points this at the fxsave area it
        // stored in the signal frame
        let fpregs = unsafe { context.uc_mcontext.fpregs.as_ref()? };

        let lanes = &fpregs.xmm_space[reg as usize * 4..reg as usize * 4 + 4];
        Some(
            lanes
                .iter()
                .rev()
                .fold(0, |acc, lane| (acc << 32) | FloatReg::from(*lane)),
        )
    }

    #[inline]
    fn register_name(reg: RegNum) -> Option<&'static str> {
        GREGS.get(reg as usize).map(|(name, _)| *name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::Cursor;

    #[test]
    fn reads_general_registers() {
        let mut context = ctx::ucontext_t::from_frame(Default::default());
        for (i, greg) in context.uc_mcontext.gregs.iter_mut().enumerate() {
            *greg = 0x100 + i as u64;
        }

        let cursor = Cursor::<X86_64>::new(&context).unwrap();
        assert_eq!(cursor.register(regs::RAX).unwrap(), 0x100 + ctx::REG_RAX);
        assert_eq!(cursor.register(regs::R8).unwrap(), 0x100 + ctx::REG_R8);
        assert_eq!(cursor.register(regs::RIP).unwrap(), 0x100 + ctx::REG_RIP);
        assert_eq!(cursor.register(regs::RFLAGS).unwrap(), 0x100 + ctx::REG_EFL);
        assert_eq!(X86_64::register_name(regs::R15), Some("r15"));
    }

    #[test]
    fn reads_xmm_registers() {
        let mut context = ctx::ucontext_t::from_frame(Default::default());
        // SAFETY: fpregset_t is plain integers
        let mut fpregs: ctx::fpregset_t = unsafe { std::mem::zeroed() };
        fpregs.xmm_space[4..8].copy_from_slice(&[0x4444_4444, 0x3333_3333, 0x2222_2222, 0x1111_1111]);
        context.uc_mcontext.fpregs = &fpregs;

        let cursor = Cursor::<X86_64>::new(&context).unwrap();
        assert_eq!(cursor.float_register(regs::XMM0).unwrap(), 0);
        assert_eq!(
            cursor.float_register(regs::XMM0 + 1).unwrap(),
            0x1111_1111_2222_2222_3333_3333_4444_4444
        );
    }
}
