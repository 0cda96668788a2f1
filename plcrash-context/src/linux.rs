mod capture;

pub use capture::{FrameRegisters, current_frame};

#[repr(C)]
#[derive(Clone)]
pub struct sigset_t {
    #[cfg(target_pointer_width = "32")]
    __val: [u32; 32],
    #[cfg(target_pointer_width = "64")]
    __val: [u64; 16],
}

#[repr(C)]
#[derive(Clone)]
pub struct stack_t {
    pub ss_sp: *mut std::ffi::c_void,
    pub ss_flags: i32,
    pub ss_size: usize,
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Number of general registers in [`mcontext_t::gregs`]
        pub const NGREG: usize = 23;

        // Indices into `mcontext_t::gregs`, these match `<sys/ucontext.h>`
        pub const REG_R8: usize = 0;
        pub const REG_R9: usize = 1;
        pub const REG_R10: usize = 2;
        pub const REG_R11: usize = 3;
        pub const REG_R12: usize = 4;
        pub const REG_R13: usize = 5;
        pub const REG_R14: usize = 6;
        pub const REG_R15: usize = 7;
        pub const REG_RDI: usize = 8;
        pub const REG_RSI: usize = 9;
        pub const REG_RBP: usize = 10;
        pub const REG_RBX: usize = 11;
        pub const REG_RDX: usize = 12;
        pub const REG_RAX: usize = 13;
        pub const REG_RCX: usize = 14;
        pub const REG_RSP: usize = 15;
        pub const REG_RIP: usize = 16;
        pub const REG_EFL: usize = 17;
        pub const REG_CSGSFS: usize = 18;
        pub const REG_ERR: usize = 19;
        pub const REG_TRAPNO: usize = 20;
        pub const REG_OLDMASK: usize = 21;
        pub const REG_CR2: usize = 22;

        #[repr(C)]
        #[derive(Clone)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_mcontext: mcontext_t,
            pub uc_sigmask: sigset_t,
            __fpregs_mem: [u64; 64],
        }

        #[repr(C)]
        #[derive(Clone)]
        pub struct mcontext_t {
            pub gregs: [u64; NGREG],
            /// Points into the signal frame, null if the kernel did not save
            /// any floating point state
            pub fpregs: *const fpregset_t,
            __reserved: [u64; 8],
        }

        /// The legacy `fxsave` area
        #[repr(C)]
        #[derive(Clone)]
        pub struct fpregset_t {
            pub cwd: u16,
            pub swd: u16,
            pub ftw: u16,
            pub fop: u16,
            pub rip: u64,
            pub rdp: u64,
            pub mxcsr: u32,
            pub mxcr_mask: u32,
            pub st_space: [u32; 32],
            pub xmm_space: [u32; 64],
            __padding: [u32; 24],
        }

        impl ucontext_t {
            #[inline]
            pub fn instruction_pointer(&self) -> usize {
                self.uc_mcontext.gregs[REG_RIP] as usize
            }

            #[inline]
            pub fn stack_pointer(&self) -> usize {
                self.uc_mcontext.gregs[REG_RSP] as usize
            }

            #[inline]
            pub fn frame_pointer(&self) -> usize {
                self.uc_mcontext.gregs[REG_RBP] as usize
            }

            #[inline]
            fn set_frame(&mut self, frame: FrameRegisters) {
                self.uc_mcontext.gregs[REG_RIP] = frame.ip as u64;
                self.uc_mcontext.gregs[REG_RSP] = frame.sp as u64;
                self.uc_mcontext.gregs[REG_RBP] = frame.fp as u64;
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// Register number of the frame pointer in [`mcontext_t::regs`]
        pub const REG_FP: usize = 29;
        /// Register number of the link register in [`mcontext_t::regs`]
        pub const REG_LR: usize = 30;

        /// Magic identifying the [`fpsimd_context`] record in
        /// [`mcontext_t::__reserved`]
        pub const FPSIMD_MAGIC: u32 = 0x4650_8001;

        #[repr(C)]
        #[derive(Clone)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_sigmask: sigset_t,
            pub uc_mcontext: mcontext_t,
        }

        #[repr(C, align(16))]
        #[derive(Clone)]
        pub struct mcontext_t {
            pub fault_address: u64,
            pub regs: [u64; 31],
            pub sp: u64,
            pub pc: u64,
            pub pstate: u64,
            /// Sequence of `_aarch64_ctx` tagged records, terminated by a
            /// record with a magic of 0
            pub __reserved: reserved_t,
        }

        #[repr(C, align(16))]
        #[derive(Clone)]
        pub struct reserved_t(pub [u8; 4096]);

        #[repr(C)]
        #[derive(Clone, Copy)]
        pub struct _aarch64_ctx {
            pub magic: u32,
            pub size: u32,
        }

        #[repr(C)]
        #[derive(Clone)]
        pub struct fpsimd_context {
            pub head: _aarch64_ctx,
            pub fpsr: u32,
            pub fpcr: u32,
            pub vregs: [u128; 32],
        }

        impl mcontext_t {
            /// Locates the FPSIMD record among the records the kernel stored in
            /// the reserved area, if it is present and well formed
            pub fn fpsimd(&self) -> Option<&fpsimd_context> {
                const HEAD: usize = std::mem::size_of::<_aarch64_ctx>();
                const FPSIMD: usize = std::mem::size_of::<fpsimd_context>();

                let reserved = &self.__reserved.0;
                let mut offset = 0;

                while offset + HEAD <= reserved.len() {
                    let magic = u32::from_ne_bytes(reserved[offset..offset + 4].try_into().ok()?);
                    let size =
                        u32::from_ne_bytes(reserved[offset + 4..offset + 8].try_into().ok()?) as usize;

                    if magic == 0 || size < HEAD {
                        return None;
                    }

                    if magic == FPSIMD_MAGIC {
                        if size < FPSIMD || offset + FPSIMD > reserved.len() || offset % 16 != 0 {
                            return None;
                        }

                        // SAFETY: the record is in bounds, and 16 byte aligned
                        // since the reserved area itself is
                        return Some(unsafe {
                            &*reserved.as_ptr().add(offset).cast::<fpsimd_context>()
                        });
                    }

                    offset += size;
                }

                None
            }
        }

        impl ucontext_t {
            #[inline]
            pub fn instruction_pointer(&self) -> usize {
                self.uc_mcontext.pc as usize
            }

            #[inline]
            pub fn stack_pointer(&self) -> usize {
                self.uc_mcontext.sp as usize
            }

            #[inline]
            pub fn frame_pointer(&self) -> usize {
                self.uc_mcontext.regs[REG_FP] as usize
            }

            #[inline]
            fn set_frame(&mut self, frame: FrameRegisters) {
                self.uc_mcontext.pc = frame.ip as u64;
                self.uc_mcontext.sp = frame.sp as u64;
                self.uc_mcontext.regs[REG_FP] = frame.fp as u64;
            }
        }
    } else {
        /// Architectures without a frame walker only ever see the context
        /// behind a pointer
        #[repr(C)]
        #[derive(Clone)]
        pub struct ucontext_t {
            _private: [u8; 0],
        }

        impl ucontext_t {
            #[inline]
            pub fn instruction_pointer(&self) -> usize {
                0
            }

            #[inline]
            pub fn stack_pointer(&self) -> usize {
                0
            }

            #[inline]
            pub fn frame_pointer(&self) -> usize {
                0
            }

            #[inline]
            fn set_frame(&mut self, _frame: FrameRegisters) {}
        }
    }
}

impl ucontext_t {
    /// Creates a context where only the instruction, stack and frame pointers
    /// are set, every other register is zero and there is no floating point
    /// state.
    ///
    /// This is used to synthesize a context for a crash report without an
    /// actual signal being raised.
    pub fn from_frame(frame: FrameRegisters) -> Self {
        // SAFETY: the context only consists of integers and raw pointers, for
        // which all zeroes is a valid value
        let mut context: Self = unsafe { std::mem::zeroed() };
        context.set_frame(frame);
        context
    }

    /// The registers needed to start walking the stack from this context
    #[inline]
    pub fn frame(&self) -> FrameRegisters {
        FrameRegisters {
            ip: self.instruction_pointer(),
            sp: self.stack_pointer(),
            fp: self.frame_pointer(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn matches_kernel_layout() {
        assert_eq!(offset_of!(ucontext_t, uc_mcontext), 40);
        assert_eq!(offset_of!(mcontext_t, fpregs), 184);
        assert_eq!(offset_of!(ucontext_t, uc_sigmask), 296);
        assert_eq!(size_of::<fpregset_t>(), 512);
        assert_eq!(offset_of!(fpregset_t, xmm_space), 160);
    }

    #[cfg(all(target_arch = "x86_64", target_env = "gnu"))]
    #[test]
    fn matches_libc_indices() {
        assert_eq!(REG_RIP, libc::REG_RIP as usize);
        assert_eq!(REG_RSP, libc::REG_RSP as usize);
        assert_eq!(REG_RBP, libc::REG_RBP as usize);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn matches_kernel_layout() {
        assert_eq!(offset_of!(ucontext_t, uc_mcontext), 176);
        assert_eq!(offset_of!(mcontext_t, sp), 256);
        assert_eq!(offset_of!(mcontext_t, pc), 264);
        assert_eq!(offset_of!(mcontext_t, __reserved), 288);
        assert_eq!(offset_of!(fpsimd_context, vregs), 16);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn finds_fpsimd_record() {
        let mut ctx = ucontext_t::from_frame(FrameRegisters::default());
        assert!(ctx.uc_mcontext.fpsimd().is_none());

        let reserved = &mut ctx.uc_mcontext.__reserved.0;
        reserved[0..4].copy_from_slice(&FPSIMD_MAGIC.to_ne_bytes());
        reserved[4..8].copy_from_slice(&(size_of::<fpsimd_context>() as u32).to_ne_bytes());
        // v1 = 0x0102
        let v1 = 16 + 16;
        reserved[v1..v1 + 16].copy_from_slice(&0x0102u128.to_ne_bytes());

        let fpsimd = ctx.uc_mcontext.fpsimd().expect("record should be found");
        assert_eq!(fpsimd.vregs[0], 0);
        assert_eq!(fpsimd.vregs[1], 0x0102);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn frame_round_trips() {
        let frame = FrameRegisters {
            ip: 0x1000,
            sp: 0x7fff_0000,
            fp: 0x7fff_0040,
        };

        let ctx = ucontext_t::from_frame(frame);
        assert_eq!(ctx.frame(), frame);
        assert_eq!(ctx.instruction_pointer(), 0x1000);
    }
}
