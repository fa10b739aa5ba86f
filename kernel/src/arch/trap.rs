//! RISC-V trap handling.

use riscv::registers::{SiFlags, Sie, Stval, Stvec};

use crate::arch::entry::{_trap_entry, _trap_frame_jump};
use crate::{drivers::plic, mm, proc, syscall, thread, timer};

// scause register flags
const CAUSE_IRQ_FLAG_MASK: u64 = 1 << 63;

// sstatus.SPP: privilege level the trap came from
const SSTATUS_SPP: u64 = 1 << 8;
// sstatus.SPIE: interrupt enable after sret
const SSTATUS_SPIE: u64 = 1 << 5;

/// Interrupt causes handled by the kernel.
const IRQ_S_TIMER: u64 = 5;
const IRQ_S_EXTERNAL: u64 = 9;

/// Possible exception causes on a RISC-V CPU.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ExceptionCause {
    InstrAddrMisaligned,
    InstrAccessFault,
    IllegalInstr,
    Breakpoint,
    LoadAddrMisaligned,
    LoadAccessFault,
    StoreAddrMisaligned,
    StoreAccessFault,
    EnvCallFromU,
    EnvCallFromS,
    InstrPageFault,
    LoadPageFault,
    StorePageFault,
}

impl From<u64> for ExceptionCause {
    fn from(n: u64) -> Self {
        use ExceptionCause::*;

        match n {
            0 => InstrAddrMisaligned,
            1 => InstrAccessFault,
            2 => IllegalInstr,
            3 => Breakpoint,
            4 => LoadAddrMisaligned,
            5 => LoadAccessFault,
            6 => StoreAddrMisaligned,
            7 => StoreAccessFault,
            8 => EnvCallFromU,
            9 => EnvCallFromS,
            12 => InstrPageFault,
            13 => LoadPageFault,
            15 => StorePageFault,
            _ => panic!("invalid exception cause: {}", n),
        }
    }
}

/// Register state saved by the trap handler.
///
/// Note: the order of the fields in this structure **must** match the order
/// in which registers are pushed to the stack in `_trap_entry`.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct TrapFrame {
    /// Return address (x1).
    pub ra: u64,
    /// Stack pointer at the time of the trap (x2).
    pub sp: u64,
    /// Global pointer (x3).
    pub gp: u64,
    /// Thread pointer (x4).
    pub tp: u64,
    /// Temporaries x5-x7.
    pub t0: u64,
    #[allow(missing_docs)]
    pub t1: u64,
    #[allow(missing_docs)]
    pub t2: u64,
    /// Callee-saved x8-x9.
    pub s0: u64,
    #[allow(missing_docs)]
    pub s1: u64,
    /// Argument registers x10-x17. `a0` carries the syscall result back.
    pub a0: u64,
    #[allow(missing_docs)]
    pub a1: u64,
    #[allow(missing_docs)]
    pub a2: u64,
    #[allow(missing_docs)]
    pub a3: u64,
    #[allow(missing_docs)]
    pub a4: u64,
    #[allow(missing_docs)]
    pub a5: u64,
    #[allow(missing_docs)]
    pub a6: u64,
    /// Syscall number register.
    pub a7: u64,
    /// Callee-saved x18-x27.
    pub s2: u64,
    #[allow(missing_docs)]
    pub s3: u64,
    #[allow(missing_docs)]
    pub s4: u64,
    #[allow(missing_docs)]
    pub s5: u64,
    #[allow(missing_docs)]
    pub s6: u64,
    #[allow(missing_docs)]
    pub s7: u64,
    #[allow(missing_docs)]
    pub s8: u64,
    #[allow(missing_docs)]
    pub s9: u64,
    #[allow(missing_docs)]
    pub s10: u64,
    #[allow(missing_docs)]
    pub s11: u64,
    /// Temporaries x28-x31.
    pub t3: u64,
    #[allow(missing_docs)]
    pub t4: u64,
    #[allow(missing_docs)]
    pub t5: u64,
    #[allow(missing_docs)]
    pub t6: u64,
    /// PC of the trapping instruction.
    pub sepc: u64,
    /// Processor state at the time of the trap.
    pub sstatus: u64,
    _pad: u64,
}

impl TrapFrame {
    /// Creates a frame that enters U-mode at `entry` with stack `sp`,
    /// interrupts enabled and argument registers `a0`/`a1` loaded.
    pub fn new_user(entry: u64, sp: u64, a0: u64, a1: u64) -> Self {
        // SAFETY: TrapFrame is plain registers, all-zero is meaningful
        let mut tf: TrapFrame = unsafe { core::mem::zeroed() };
        tf.sepc = entry;
        tf.ra = entry;
        tf.sp = sp;
        tf.a0 = a0;
        tf.a1 = a1;
        // SPP clear selects U-mode; SPIE enables interrupts after sret.
        tf.sstatus = (riscv::registers::Sstatus::read_raw() & !SSTATUS_SPP) | SSTATUS_SPIE;
        tf
    }

    /// Returns whether this trap was taken from U-mode.
    pub fn from_user(&self) -> bool {
        self.sstatus & SSTATUS_SPP == 0
    }

    /// Prints the content of the trap frame to the console.
    #[rustfmt::skip]
    fn dump(&self) {
        let s = self;
        kprintln!(" PC was at {:016x}", s.sepc);
        kprintln!(" RA was at {:016x}", s.ra);
        kprintln!(" sp : {:016x}  gp : {:016x}  tp : {:016x}", s.sp, s.gp, s.tp);
        kprintln!(" t0 : {:016x}  t1 : {:016x}  t2 : {:016x}", s.t0, s.t1, s.t2);
        kprintln!(" s0 : {:016x}  s1 : {:016x}  a0 : {:016x}", s.s0, s.s1, s.a0);
        kprintln!(" a1 : {:016x}  a2 : {:016x}  a3 : {:016x}", s.a1, s.a2, s.a3);
        kprintln!(" a4 : {:016x}  a5 : {:016x}  a6 : {:016x}", s.a4, s.a5, s.a6);
        kprintln!(" a7 : {:016x}  s2 : {:016x}  s3 : {:016x}", s.a7, s.s2, s.s3);
        kprintln!(" s4 : {:016x}  s5 : {:016x}  s6 : {:016x}", s.s4, s.s5, s.s6);
        kprintln!(" s7 : {:016x}  s8 : {:016x}  s9 : {:016x}", s.s7, s.s8, s.s9);
        kprintln!(" s10: {:016x}  s11: {:016x}  t3 : {:016x}", s.s10, s.s11, s.t3);
        kprintln!(" t4 : {:016x}  t5 : {:016x}  t6 : {:016x}", s.t4, s.t5, s.t6);
    }
}

#[no_mangle]
extern "C" fn handle_trap(tf: &mut TrapFrame) {
    let cause = riscv::registers::Scause::read();
    let is_irq = (cause & CAUSE_IRQ_FLAG_MASK) != 0;
    let code = cause & !CAUSE_IRQ_FLAG_MASK;

    if is_irq {
        match code {
            IRQ_S_TIMER => {
                timer::handle_timer_interrupt();
                // A woken alarm may have made a thread ready; translate the
                // interrupt into a yield at this safe point.
                thread::preempt();
            }
            IRQ_S_EXTERNAL => plic::handle_external_interrupt(),
            n => kprintln!("unexpected interrupt: {}", n),
        }
        return;
    }

    use ExceptionCause::*;

    match ExceptionCause::from(code) {
        EnvCallFromU => syscall::handle_syscall(tf),
        InstrPageFault | LoadPageFault | StorePageFault if tf.from_user() => {
            let vma = Stval::read() as usize;
            if !mm::handle_umode_page_fault(tf, vma) {
                kprintln!(
                    "<{}:{}> unhandled page fault at {:016x}",
                    thread::running_thread_name(),
                    thread::running_thread(),
                    vma
                );
                proc::exit();
            }
        }
        ex if tf.from_user() => {
            kprintln!(
                "<{}:{}> unhandled exception: {:?}, tval {:016x}",
                thread::running_thread_name(),
                thread::running_thread(),
                ex,
                Stval::read()
            );
            proc::exit();
        }
        ex => {
            kprintln!("=> Unhandled exception: {:?}, tval {:016x}", ex, Stval::read());
            tf.dump();
            panic!("fatal exception in S-mode");
        }
    }
}

/// Restores `tf` and enters the mode selected by its `sstatus`; `kstack_top`
/// becomes the trap stack for the next U-mode trap.
///
/// # Safety
///
/// The frame must describe a valid execution context in the active address
/// space, and `kstack_top` must point to the top of the calling thread's
/// kernel stack.
pub unsafe fn trap_frame_jump(tf: &TrapFrame, kstack_top: u64) -> ! {
    unsafe { _trap_frame_jump(tf, kstack_top) }
}

/// Configures the trap vector used to handle traps in S-mode and enables
/// the interrupt sources served by the kernel.
pub fn init() {
    Stvec::write(_trap_entry as *const () as u64);

    Sie::set(SiFlags::SSIE | SiFlags::STIE | SiFlags::SEIE);
    crate::arch::enable_interrupts();
}
