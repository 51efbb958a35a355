//! Transition frames for unmanaged helpers.
//!
//! An unmanaged helper that may end up triggering a collection (an
//! allocation helper, a wait helper, an exception helper) was not written
//! with stack walking in mind. Before doing anything that could provoke
//! the collector, it builds a frame describing the managed state at entry:
//! which registers were preserved into the frame, the caller's stack
//! pointer, the owning thread, and whether either argument register holds
//! a live reference. The collector's stack walker starts scanning at the
//! helper's caller using exactly that record.
//!
//! Building the frame strictly before any collection-capable operation is
//! a correctness precondition, not a performance one: a collection
//! triggered first has no way to find the helper's live references. The
//! helper entry points in [`crate::helpers`] encode the ordering by
//! requiring a [`PushedFrame`] before they touch the heap.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use bitflags::bitflags;

use crate::thread::SharedThreadState;

/// Number of preserved general registers in the modeled convention.
pub const PRESERVED_REG_COUNT: usize = 10;

bitflags! {
    /// Bit layout shared between frame producers and the stack walker.
    ///
    /// These positions are a binary contract: the walker decodes saved
    /// slots and reference taint from them, so changing them requires
    /// recompiling every producer and consumer together.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u64 {
        /// Preserved register r19 was saved into the frame.
        const SAVE_R19 = 0x0000_0001;
        /// Preserved register r20 was saved into the frame.
        const SAVE_R20 = 0x0000_0002;
        /// Preserved register r21 was saved into the frame.
        const SAVE_R21 = 0x0000_0004;
        /// Preserved register r22 was saved into the frame.
        const SAVE_R22 = 0x0000_0008;
        /// Preserved register r23 was saved into the frame.
        const SAVE_R23 = 0x0000_0010;
        /// Preserved register r24 was saved into the frame.
        const SAVE_R24 = 0x0000_0020;
        /// Preserved register r25 was saved into the frame.
        const SAVE_R25 = 0x0000_0040;
        /// Preserved register r26 was saved into the frame.
        const SAVE_R26 = 0x0000_0080;
        /// Preserved register r27 was saved into the frame.
        const SAVE_R27 = 0x0000_0100;
        /// Preserved register r28 was saved into the frame.
        const SAVE_R28 = 0x0000_0200;
        /// All ten preserved registers.
        const SAVE_ALL_PRESERVED = 0x0000_03FF;
        /// The entry stack pointer was saved into the frame.
        const SAVE_SP = 0x0000_0400;
        /// The frame pointer was saved into the frame.
        const SAVE_FP = 0x4000_0000;
        /// The return address was saved into the frame.
        const SAVE_RA = 0x8000_0000;
        /// Argument register 0 holds an object reference
        /// (meaningful only with `SAVE_ARG0`-class saves).
        const ARG0_GCREF = 1 << 32;
        /// Argument register 0 holds a by-reference value; clear means
        /// object or scalar per `ARG0_GCREF`.
        const ARG0_BYREF = 1 << 33;
        /// Argument register 1 holds an object reference.
        const ARG1_GCREF = 1 << 34;
        /// Argument register 1 holds a by-reference value.
        const ARG1_BYREF = 1 << 35;
        /// A pending abort must be raised when the helper returns.
        const THREAD_ABORT = 1 << 36;
    }
}

/// Save mask every helper frame carries: the full preserved set plus the
/// entry stack pointer.
pub const DEFAULT_FRAME_SAVE_FLAGS: FrameFlags =
    FrameFlags::SAVE_ALL_PRESERVED.union(FrameFlags::SAVE_SP);

/// The preservable machine registers, as one shared vocabulary for the
/// frame builder and the stack walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreservedReg {
    /// Preserved general register r19.
    R19,
    /// Preserved general register r20.
    R20,
    /// Preserved general register r21.
    R21,
    /// Preserved general register r22.
    R22,
    /// Preserved general register r23.
    R23,
    /// Preserved general register r24.
    R24,
    /// Preserved general register r25.
    R25,
    /// Preserved general register r26.
    R26,
    /// Preserved general register r27.
    R27,
    /// Preserved general register r28.
    R28,
}

impl PreservedReg {
    /// All preserved registers in slot order.
    pub const ALL: [Self; PRESERVED_REG_COUNT] = [
        Self::R19,
        Self::R20,
        Self::R21,
        Self::R22,
        Self::R23,
        Self::R24,
        Self::R25,
        Self::R26,
        Self::R27,
        Self::R28,
    ];

    /// Frame slot index for this register.
    #[must_use]
    pub const fn slot(self) -> usize {
        self as usize
    }

    /// The save bit assigned to this register in [`FrameFlags`].
    #[must_use]
    pub const fn save_bit(self) -> FrameFlags {
        FrameFlags::from_bits_truncate(1 << (self as u64))
    }
}

/// Machine state at helper entry, as captured by the helper's prologue.
///
/// In a full code generator this is produced by the emitted save
/// sequence; here it is an explicit value so helpers and tests construct
/// it directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterFile {
    /// The preserved general registers r19..r28, in slot order.
    pub preserved: [usize; PRESERVED_REG_COUNT],
    /// Frame pointer.
    pub fp: usize,
    /// Stack pointer as it was at helper entry.
    pub sp: usize,
    /// Return address into the helper's caller.
    pub ra: usize,
    /// The two argument registers of the helper convention.
    pub args: [usize; 2],
}

/// A stack-resident record of managed state at helper entry.
///
/// The walker correlates the frame with per-thread state through
/// [`thread_id`](Self::thread_id) and reads the save mask to know which
/// slots are valid roots and which are scratch.
#[derive(Debug)]
pub struct TransitionFrame {
    thread_id: u64,
    flags: FrameFlags,
    caller_sp: usize,
    preserved: [usize; PRESERVED_REG_COUNT],
    fp: usize,
    ra: usize,
    args: [usize; 2],
}

impl TransitionFrame {
    /// Builds a frame from the entry register file.
    ///
    /// The save mask is [`DEFAULT_FRAME_SAVE_FLAGS`]; the reference-taint
    /// bits start clear and are set explicitly by helpers whose argument
    /// registers carry live references.
    #[must_use]
    pub fn build(thread_id: u64, regs: &RegisterFile) -> Self {
        Self {
            thread_id,
            flags: DEFAULT_FRAME_SAVE_FLAGS,
            caller_sp: regs.sp,
            preserved: regs.preserved,
            fp: regs.fp,
            ra: regs.ra,
            args: regs.args,
        }
    }

    /// Marks argument register `index` as holding an object reference.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not 0 or 1.
    pub fn mark_arg_gcref(&mut self, index: usize) {
        self.flags.insert(match index {
            0 => FrameFlags::ARG0_GCREF,
            1 => FrameFlags::ARG1_GCREF,
            _ => panic!("argument register index {index} out of range"),
        });
    }

    /// Marks argument register `index` as holding a by-reference value.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not 0 or 1.
    pub fn mark_arg_byref(&mut self, index: usize) {
        self.flags.insert(match index {
            0 => FrameFlags::ARG0_BYREF,
            1 => FrameFlags::ARG1_BYREF,
            _ => panic!("argument register index {index} out of range"),
        });
    }

    /// Records that a pending abort must be raised when the helper
    /// returns. Consulted by the resuming code, not acted on here.
    pub fn set_abort_pending(&mut self) {
        self.flags.insert(FrameFlags::THREAD_ABORT);
    }

    /// Whether a pending abort was recorded.
    #[must_use]
    pub const fn is_abort_pending(&self) -> bool {
        self.flags.contains(FrameFlags::THREAD_ABORT)
    }

    /// Owning thread identity.
    #[must_use]
    pub const fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// The save mask and taint bits.
    #[must_use]
    pub const fn flags(&self) -> FrameFlags {
        self.flags
    }

    /// Stack pointer of the helper's caller.
    #[must_use]
    pub const fn caller_sp(&self) -> usize {
        self.caller_sp
    }

    /// Saved value of `reg`, or `None` if the mask says the slot is
    /// scratch.
    #[must_use]
    pub fn preserved_slot(&self, reg: PreservedReg) -> Option<usize> {
        if self.flags.contains(reg.save_bit()) {
            Some(self.preserved[reg.slot()])
        } else {
            None
        }
    }

    /// Saved argument-register value.
    #[must_use]
    pub const fn arg(&self, index: usize) -> usize {
        self.args[index]
    }

    /// The argument-register values the taint bits declare as object
    /// references or by-reference values: the roots this frame
    /// contributes beyond the preserved set.
    pub fn reference_args(&self) -> impl Iterator<Item = usize> + '_ {
        let arg0 = self
            .flags
            .intersects(FrameFlags::ARG0_GCREF | FrameFlags::ARG0_BYREF)
            .then_some(self.args[0]);
        let arg1 = self
            .flags
            .intersects(FrameFlags::ARG1_GCREF | FrameFlags::ARG1_BYREF)
            .then_some(self.args[1]);
        arg0.into_iter().chain(arg1)
    }

    /// Restores the entry register file from the saved slots, the exit
    /// half of the helper protocol.
    #[must_use]
    pub const fn restore(&self) -> RegisterFile {
        RegisterFile {
            preserved: self.preserved,
            fp: self.fp,
            sp: self.caller_sp,
            ra: self.ra,
            args: self.args,
        }
    }
}

/// RAII linkage of a [`TransitionFrame`] to its owning thread.
///
/// While the guard lives, the frame is the thread's topmost transition
/// frame and the walker will find it; dropping the guard unlinks it,
/// after which the frame is no longer part of the thread's live call
/// chain. Frames nest with helper calls, so the guard restores the
/// previous top on drop.
#[must_use = "the frame is only walkable while the guard is held"]
pub struct PushedFrame<'t> {
    thread: &'t SharedThreadState,
    previous: *mut TransitionFrame,
}

impl<'t> PushedFrame<'t> {
    /// Links `frame` as `thread`'s topmost transition frame.
    pub fn link(thread: &'t SharedThreadState, frame: &'t TransitionFrame) -> Self {
        debug_assert_eq!(
            frame.thread_id(),
            thread.id(),
            "transition frame linked to a foreign thread"
        );
        let raw = std::ptr::from_ref(frame).cast_mut();
        let previous = thread.top_frame().swap(raw, Ordering::AcqRel);
        Self { thread, previous }
    }

    /// The linked frame, as the walker would see it.
    #[must_use]
    pub fn frame(&self) -> Option<NonNull<TransitionFrame>> {
        NonNull::new(self.thread.top_frame().load(Ordering::Acquire))
    }
}

impl Drop for PushedFrame<'_> {
    fn drop(&mut self) {
        self.thread
            .top_frame()
            .store(self.previous, Ordering::Release);
    }
}
