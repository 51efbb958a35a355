//! The transition-frame protocol as the stack walker sees it: linked
//! frames are visible, popped frames are not, and helper entry points
//! build their frame before any collection-capable work.

use magpie_gc::thread::ThreadRegistry;
use magpie_gc::{
    attach_current, detach_current, throw_managed, with_current, ExceptionPort, FrameFlags,
    HeapConfig, HeapKind, HeapRegistry, PushedFrame, RegisterFile, TransitionFrame,
    DEFAULT_FRAME_SAVE_FLAGS,
};

#[test]
fn walker_sees_the_pushed_frame_and_not_the_popped_one() {
    let threads = ThreadRegistry::new();
    let shared = attach_current(&threads);
    assert!(shared.top_transition_frame().is_none());

    let regs = RegisterFile {
        preserved: [0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19],
        sp: 0x7000_0000,
        ..RegisterFile::default()
    };
    let frame = TransitionFrame::build(shared.id(), &regs);
    {
        let _pushed = PushedFrame::link(&shared, &frame);
        let top = shared.top_transition_frame().expect("frame must be walkable");
        let top = unsafe { top.as_ref() };
        assert_eq!(top.thread_id(), shared.id());
        assert_eq!(top.flags(), DEFAULT_FRAME_SAVE_FLAGS);
        assert_eq!(top.caller_sp(), 0x7000_0000);
    }
    assert!(
        shared.top_transition_frame().is_none(),
        "a popped frame must no longer be reachable by the walker"
    );
    detach_current(&threads);
}

#[test]
fn nested_helper_frames_restore_the_previous_top() {
    let threads = ThreadRegistry::new();
    let shared = attach_current(&threads);

    let outer = TransitionFrame::build(shared.id(), &RegisterFile::default());
    let inner = TransitionFrame::build(shared.id(), &RegisterFile::default());

    let pushed_outer = PushedFrame::link(&shared, &outer);
    let outer_ptr = shared.top_transition_frame().unwrap();
    {
        let _pushed_inner = PushedFrame::link(&shared, &inner);
        let top = shared.top_transition_frame().unwrap();
        assert_ne!(top, outer_ptr, "inner frame must shadow the outer one");
    }
    assert_eq!(shared.top_transition_frame(), Some(outer_ptr));
    drop(pushed_outer);
    assert!(shared.top_transition_frame().is_none());
    detach_current(&threads);
}

/// Dispatch that plays the stack walker: at raise time, the helper's
/// frame must already be linked and must declare the exception register.
struct WalkingPort;

impl ExceptionPort for WalkingPort {
    fn raise_hardware_fault(&self, code: u32, fault_address: usize) -> ! {
        panic!("hw fault {code} at {fault_address:#x}")
    }

    fn raise_managed(&self, exception: usize) -> ! {
        let top = with_current(|t| t.shared().top_transition_frame())
            .expect("the throw helper must link its frame before dispatch");
        let frame = unsafe { top.as_ref() };
        assert!(
            frame.flags().contains(FrameFlags::ARG0_GCREF),
            "the exception register must be declared as a reference"
        );
        assert_eq!(frame.reference_args().collect::<Vec<_>>(), vec![exception]);
        panic!("managed throw dispatched")
    }

    fn rethrow(&self) -> ! {
        panic!("rethrow dispatched")
    }
}

#[test]
fn throw_helper_links_a_tainted_frame_before_dispatch() {
    let registry = HeapRegistry::new();
    registry
        .load(&HeapConfig {
            kind: Some(HeapKind::Workstation),
            reserve_bytes: 4 * 1024 * 1024,
            ..HeapConfig::default()
        })
        .unwrap();
    registry.set_exception_port(Box::new(WalkingPort));
    attach_current(registry.threads());

    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        throw_managed(&registry, 0xBEEF_0008)
    }));
    let message = *caught.unwrap_err().downcast::<&str>().unwrap();
    assert_eq!(message, "managed throw dispatched");

    // The frame unwound with the helper; nothing is left linked.
    let top = with_current(|t| t.shared().top_transition_frame());
    assert!(top.is_none());
    detach_current(registry.threads());
}
