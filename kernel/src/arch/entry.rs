//! Boot, trap and context-switch assembly.
//!
//! The layouts of [`crate::arch::trap::TrapFrame`] and
//! [`crate::thread::Context`] must match the offsets used here.

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    r#"
    .section .text._start
    .globl _start
_start:
    # SBI enters with a0 = hartid, a1 = devicetree. Neither is used: the
    # platform layout is fixed at compile time.
    la sp, _boot_stack_top
    call start_kernel
1:  wfi
    j 1b

    .section .bss.stack
    .align 4
    .globl _boot_stack_lowest
_boot_stack_lowest:
    .space 65536
    .globl _boot_stack_top
_boot_stack_top:
"#
);

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    r#"
    .section .text
    .align 4
    .globl _trap_entry
_trap_entry:
    # sscratch holds the kernel stack top while in U-mode and 0 while in
    # S-mode, so a swap tells the two apart.
    csrrw sp, sscratch, sp
    bnez sp, 1f
    csrrw sp, sscratch, sp
1:
    addi sp, sp, -272
    sd ra, 0(sp)
    sd gp, 16(sp)
    sd tp, 24(sp)
    sd t0, 32(sp)
    sd t1, 40(sp)
    sd t2, 48(sp)
    sd s0, 56(sp)
    sd s1, 64(sp)
    sd a0, 72(sp)
    sd a1, 80(sp)
    sd a2, 88(sp)
    sd a3, 96(sp)
    sd a4, 104(sp)
    sd a5, 112(sp)
    sd a6, 120(sp)
    sd a7, 128(sp)
    sd s2, 136(sp)
    sd s3, 144(sp)
    sd s4, 152(sp)
    sd s5, 160(sp)
    sd s6, 168(sp)
    sd s7, 176(sp)
    sd s8, 184(sp)
    sd s9, 192(sp)
    sd s10, 200(sp)
    sd s11, 208(sp)
    sd t3, 216(sp)
    sd t4, 224(sp)
    sd t5, 232(sp)
    sd t6, 240(sp)

    csrr t0, sscratch
    beqz t0, 2f
    # From U-mode: the pre-trap stack pointer sits in sscratch. Clear it so a
    # nested trap from S-mode takes the kernel path above.
    sd t0, 8(sp)
    csrw sscratch, zero
    j 3f
2:  # From S-mode: the pre-trap stack pointer is just above the frame.
    addi t0, sp, 272
    sd t0, 8(sp)
3:
    csrr t0, sepc
    sd t0, 248(sp)
    csrr t1, sstatus
    sd t1, 256(sp)

    mv a0, sp
    call handle_trap

    ld t0, 248(sp)
    csrw sepc, t0
    ld t1, 256(sp)
    csrw sstatus, t1

    # Returning to U-mode: point sscratch back at the kernel stack top.
    andi t0, t1, (1 << 8)
    bnez t0, 4f
    addi t0, sp, 272
    csrw sscratch, t0
4:
    ld ra, 0(sp)
    ld gp, 16(sp)
    ld tp, 24(sp)
    ld t1, 40(sp)
    ld t2, 48(sp)
    ld s0, 56(sp)
    ld s1, 64(sp)
    ld a0, 72(sp)
    ld a1, 80(sp)
    ld a2, 88(sp)
    ld a3, 96(sp)
    ld a4, 104(sp)
    ld a5, 112(sp)
    ld a6, 120(sp)
    ld a7, 128(sp)
    ld s2, 136(sp)
    ld s3, 144(sp)
    ld s4, 152(sp)
    ld s5, 160(sp)
    ld s6, 168(sp)
    ld s7, 176(sp)
    ld s8, 184(sp)
    ld s9, 192(sp)
    ld s10, 200(sp)
    ld s11, 208(sp)
    ld t3, 216(sp)
    ld t4, 224(sp)
    ld t5, 232(sp)
    ld t6, 240(sp)
    ld t0, 32(sp)
    ld sp, 8(sp)
    sret

    .align 2
    .globl _thread_switch
_thread_switch:
    # a0: saved context of the outgoing thread, a1: context of the incoming
    # thread. Only callee-saved state crosses a cooperative switch.
    sd ra, 0(a0)
    sd sp, 8(a0)
    sd s0, 16(a0)
    sd s1, 24(a0)
    sd s2, 32(a0)
    sd s3, 40(a0)
    sd s4, 48(a0)
    sd s5, 56(a0)
    sd s6, 64(a0)
    sd s7, 72(a0)
    sd s8, 80(a0)
    sd s9, 88(a0)
    sd s10, 96(a0)
    sd s11, 104(a0)

    ld ra, 0(a1)
    ld sp, 8(a1)
    ld s0, 16(a1)
    ld s1, 24(a1)
    ld s2, 32(a1)
    ld s3, 40(a1)
    ld s4, 48(a1)
    ld s5, 56(a1)
    ld s6, 64(a1)
    ld s7, 72(a1)
    ld s8, 80(a1)
    ld s9, 88(a1)
    ld s10, 96(a1)
    ld s11, 104(a1)
    ret

    .align 2
    .globl _thread_startup
_thread_startup:
    # First activation of a spawned thread: s0 holds its entry closure.
    mv a0, s0
    call thread_run

    .align 2
    .globl _trap_frame_jump
_trap_frame_jump:
    # a0: trap frame to restore, a1: kernel stack top for the next trap.
    csrw sscratch, a1
    ld t0, 248(a0)
    csrw sepc, t0
    ld t0, 256(a0)
    csrw sstatus, t0
    ld ra, 0(a0)
    ld gp, 16(a0)
    ld tp, 24(a0)
    ld t0, 32(a0)
    ld t1, 40(a0)
    ld t2, 48(a0)
    ld s0, 56(a0)
    ld s1, 64(a0)
    ld a1, 80(a0)
    ld a2, 88(a0)
    ld a3, 96(a0)
    ld a4, 104(a0)
    ld a5, 112(a0)
    ld a6, 120(a0)
    ld a7, 128(a0)
    ld s2, 136(a0)
    ld s3, 144(a0)
    ld s4, 152(a0)
    ld s5, 160(a0)
    ld s6, 168(a0)
    ld s7, 176(a0)
    ld s8, 184(a0)
    ld s9, 192(a0)
    ld s10, 200(a0)
    ld s11, 208(a0)
    ld t3, 216(a0)
    ld t4, 224(a0)
    ld t5, 232(a0)
    ld t6, 240(a0)
    ld sp, 8(a0)
    ld a0, 72(a0)
    sret
"#
);

#[allow(non_upper_case_globals)]
extern "C" {
    /// Trap vector installed in `stvec`.
    pub fn _trap_entry();

    /// Saves the outgoing context and resumes the incoming one.
    pub fn _thread_switch(old: *mut crate::thread::Context, new: *const crate::thread::Context);

    /// First-activation trampoline for spawned threads.
    pub fn _thread_startup();

    /// Restores a trap frame and enters the mode selected by its `sstatus`.
    pub fn _trap_frame_jump(tf: *const crate::arch::trap::TrapFrame, kstack_top: u64) -> !;

    /// Top of the boot stack, used as the main thread's trap stack.
    pub static _boot_stack_top: u8;
}

/// Host stand-ins so the kernel library typechecks off-target.
#[cfg(not(target_arch = "riscv64"))]
#[allow(non_upper_case_globals)]
mod host_stubs {
    #[no_mangle]
    extern "C" fn _trap_entry() {
        unimplemented!("trap entry is only available on riscv64")
    }

    #[no_mangle]
    extern "C" fn _thread_switch(
        _old: *mut crate::thread::Context,
        _new: *const crate::thread::Context,
    ) {
        unimplemented!("context switching is only available on riscv64")
    }

    #[no_mangle]
    extern "C" fn _thread_startup() {
        unimplemented!("thread startup is only available on riscv64")
    }

    #[no_mangle]
    extern "C" fn _trap_frame_jump(
        _tf: *const crate::arch::trap::TrapFrame,
        _kstack_top: u64,
    ) -> ! {
        unimplemented!("user-mode entry is only available on riscv64")
    }

    #[no_mangle]
    static _boot_stack_top: u8 = 0;
}
