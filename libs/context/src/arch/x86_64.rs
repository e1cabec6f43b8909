// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! SysV x86_64 stack switching.
//!
//! The assembly here is corosensei's (Amanieu d'Antras, dual
//! MIT/Apache-2.0), kept intact: the RBX/RBP hand-save (both LLVM-reserved),
//! the RSI/RDX/RDI register protocol and the `.cfi_escape` programs form one
//! verified unit. See the crate docs for what this crate changes around it.
//!
//! ## Stack layout
//!
//! Layout of a task stack while the task is suspended:
//!
//! ```text
//! +--------------+  <- Stack top
//! | Entry func   |
//! +--------------+
//! | Parent link  |
//! +--------------+
//! |              |
//! ~     ...      ~
//! |              |
//! +--------------+
//! | Resume PC    |
//! +--------------+  <- Saved stack pointer
//! ```
//!
//! And of the scheduler stack while a task is running:
//!
//! ```text
//! |              |
//! ~     ...      ~
//! |              |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Return PC    |
//! +--------------+
//! | Saved RBP    |
//! +--------------+  <- Parent link target
//! ```
//!
//! The parent link lives 16 bytes below the task stack top and is refreshed
//! on every [`switch_in`], so the task can return to whichever scheduler
//! stack most recently resumed it.

use crate::{EncodedValue, Entry, StackPointer, push_payload, push_word};
use core::arch::{asm, naked_asm};

pub const STACK_ALIGNMENT: usize = 16;

pub(crate) unsafe fn prepare_stack<T>(
    top: StackPointer,
    entry: Entry<T>,
    payload: T,
) -> StackPointer {
    // Safety: ensured by caller
    unsafe {
        let mut sp = top.get();

        // Address of the entry function, read by the trampoline.
        push_word(&mut sp, Some(entry as usize));

        // Parent link placeholder, filled in by every switch_in.
        push_word(&mut sp, None);

        // The payload the entry function receives, aligned for T.
        push_payload(&mut sp, 16, payload);

        // First resume PC: the entry trampoline.
        push_word(&mut sp, Some(entry_trampoline as usize));

        StackPointer::new_unchecked(sp)
    }
}

#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm! {
        ".balign 16",
        ".cfi_startproc",
        // Reached via the CALL in switch_in the first time a task runs.
        // Register state at this point:
        // - RSP points to the top of the scheduler stack.
        // - RBP holds its value from the scheduler context.
        // - RDX points to the top of the task stack.
        // - RSI points to the task stack top (the stack base).
        // - RDI carries the word passed to switch_in.
        //
        // Complete the scheduler-side frame record: together with the return
        // address pushed by CALL, this RBP forms a valid entry in the frame
        // pointer chain.
        "push rbp",
        // Publish the scheduler stack pointer through the parent link two
        // words below the task stack top, and point RSI at the link itself:
        // it becomes the entry function's second argument.
        "mov [rsi - 16], rsp",
        "sub rsi, 16",
        // Move onto the task stack, skipping the resume PC slot that holds
        // this trampoline's own address.
        "lea rsp, [rdx + 8]",
        // Frame pointer = parent link, for the CFI expression below.
        "mov rbp, rsi",
        // Teach the unwinder to find the scheduler frame: deref RBP to get
        // the scheduler stack pointer, then skip the three saved words.
        ".cfi_escape 0x0f,  /* DW_CFA_def_cfa_expression */\
        5,                  /* the byte length of this expression */\
        0x76, 0x00,         /* DW_OP_breg6 (rbp + 0) */\
        0x06,               /* DW_OP_deref */\
        0x23, 0x18          /* DW_OP_plus_uconst 24 */",
        ".cfi_offset rbx, -8",
        ".cfi_offset rip, -16",
        ".cfi_offset rbp, -24",
        // Third argument: the payload placed by prepare_stack, which now sits
        // exactly at RSP.
        "mov rdx, rsp",
        // Enter the task with a hand-built return address instead of CALL so
        // the return predictor is not left misaligned by the RET executed
        // later in switch_out / switch_done.
        "lea rcx, [rip + 2f]",
        "push rcx",
        // prepare_stack stored the entry function right above the parent link.
        "jmp [rsi + 8]",
        // The entry function never returns (its type is `-> !`).
        "2:",
        ".cfi_endproc",
    }
}

/// Resumes a task, publishing our own stack pointer through its parent link.
///
/// Returns the word the task passed out and its new saved stack pointer, or
/// `None` if the task finished via [`switch_done`].
///
/// # Safety
///
/// `sp` must be a stack pointer produced by [`prepare_stack`](crate::prepare_stack)
/// or a previous [`switch_in`] on the stack whose top is `top`, and that stack
/// must be suspended.
#[inline]
pub unsafe fn switch_in(
    arg: EncodedValue,
    sp: StackPointer,
    top: StackPointer,
) -> (EncodedValue, Option<StackPointer>) {
    let (ret_val, ret_sp);

    // Safety: inline assembly
    unsafe {
        asm! {
            // RBX is an LLVM reserved register, so it cannot appear in the
            // clobber list and is saved by hand. RBP is saved later, on the
            // far side of the CALL, so the frame record stays intact.
            "push rbx",

            // DW_CFA_GNU_args_size 0: neutralize any args_size a previous
            // call site in this function may have left behind.
            ".cfi_escape 0x2e, 0x00",

            // Push our resume PC and jump to the task's saved resume PC.
            // Execution continues in entry_trampoline or at label 2 of
            // switch_out.
            "call [rdx]",

            // Back from the task. Register state:
            // - RSP: our stack, return address and RBP already popped.
            // - RSI: the task's saved stack pointer, or 0 from switch_done.
            // - RDI: the word passed by the task.
            "pop rbx",

            // RDI doubles as the first-argument register of the SysV ABI, so
            // the word flows through to the entry function unchanged.
            inlateout("rdi") arg => ret_val,
            // Register choice must match switch_out / switch_done.
            lateout("rsi") ret_sp,
            // The task stack top rides in RSI; the trampoline turns it into
            // the parent-link address.
            in("rsi") top.get() as u64,
            // Target stack pointer; must match the register switch_out reads.
            in("rdx") sp.get() as u64,
            // Everything else is clobbered. Declaring the clobbers here lets
            // the compiler coalesce save/restore across consecutive switches.
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
        }
    }

    (ret_val, StackPointer::new(ret_sp))
}

/// Suspends the current task, returning to the scheduler stack recorded in
/// `parent_link`. Comes back when the task is next resumed, carrying the word
/// passed to that [`switch_in`].
///
/// # Safety
///
/// Must execute on a task stack whose parent link was written by a live
/// [`switch_in`] frame.
#[inline(always)]
pub unsafe fn switch_out(arg: EncodedValue, parent_link: *mut StackPointer) -> EncodedValue {
    let ret_val;

    // Safety: inline assembly
    unsafe {
        asm! {
            // RBP and RBX are LLVM reserved registers, save them by hand.
            "push rbp",
            "push rbx",

            // Resume PC for the next switch_in.
            "lea rax, [rip + 2f]",
            "push rax",

            // Hand our stack pointer out through RSI and adopt the scheduler
            // stack from the parent link.
            "mov rsi, rsp",
            "mov rsp, [rdx]",

            // The scheduler's RBP sits at the top of its stack.
            "pop rbp",

            // DW_CFA_GNU_args_size 0, as in switch_in.
            ".cfi_escape 0x2e, 0x00",

            // Return into switch_in, right after its CALL.
            "ret",

            // Next resume enters here, with the same register contract as the
            // trampoline: RDX = our stack top incl. resume PC, RSI = stack
            // base, RDI = the incoming word.
            "2:",

            // Rebuild the scheduler-side frame record and refresh the parent
            // link for this resume.
            "push rbp",
            "mov [rsi - 16], rsp",

            // Back onto the task stack, dropping the consumed resume PC.
            "lea rsp, [rdx + 8]",

            "pop rbx",
            "pop rbp",

            inlateout("rdi") arg => ret_val,
            // The parent link may arrive in any register; RDX matches
            // switch_in's choice of target register.
            in("rdx") parent_link as u64,
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
        }
    }

    ret_val
}

/// Leaves the current task permanently. The matching [`switch_in`] observes a
/// `None` stack pointer and must never resume this stack again.
///
/// # Safety
///
/// Same contract as [`switch_out`]; additionally nothing on this task stack
/// may be touched afterwards.
#[inline(always)]
pub unsafe fn switch_done(arg: EncodedValue, parent_link: *mut StackPointer) -> ! {
    // Safety: inline assembly
    unsafe {
        asm! {
            // Adopt the scheduler stack; its RBP is on top, then the return
            // address pushed by switch_in's CALL.
            "mov rsp, [{parent_link}]",
            "pop rbp",
            "ret",

            parent_link = in(reg) parent_link as u64,
            in("rdi") arg,
            // A zero stack pointer tells switch_in the task is finished.
            in("rsi") 0,
            options(noreturn),
        }
    }
}
