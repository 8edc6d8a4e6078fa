//! Command and kernel level integration tests.
//!
//! These run real scheduler backends against the simulated device.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use accel_sched::prelude::*;
use accel_sched::CompletionMode;
use common::{eventually, Fixture};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_run_while_in_flight_fails() {
    let fx = Fixture::sws(2, CompletionMode::Manual);
    let cmd = fx.command(Opcode::StartCu);
    cmd.set_cu_mask(&[0]).unwrap();
    cmd.set_payload_len(4).unwrap();

    cmd.run().unwrap();
    assert!(eventually(WAIT, || fx.sim.cu_running(0) == 1));
    assert!(matches!(cmd.run(), Err(ExecError::CommandBusy(_))));
    assert_eq!(fx.sim.cu_starts(0), 1);

    assert!(fx.sim.complete_cu(0));
    assert_eq!(cmd.wait(None).unwrap(), CommandState::Completed);

    // Runs again once the first execution has completed.
    cmd.run().unwrap();
    assert!(eventually(WAIT, || fx.sim.cu_running(0) == 1));
    fx.sim.complete_cu(0);
    assert_eq!(cmd.wait(None).unwrap(), CommandState::Completed);
    fx.runtime.shutdown().unwrap();
}

#[test]
fn test_exec_buffers_are_conserved() {
    let fx = Fixture::sws(1, CompletionMode::Immediate);
    let id = fx.device.id();
    let pool = Arc::clone(fx.runtime.exec_buffers());
    let before = pool.allocations(id);

    let cmds: Vec<_> = (0..8).map(|_| fx.command(Opcode::StartCu)).collect();
    drop(cmds);
    let allocated = pool.allocations(id);
    assert!(allocated - before <= 8);
    assert!(eventually(WAIT, || pool.free_count(id) as u64 == allocated));

    let again: Vec<_> = (0..8).map(|_| fx.command(Opcode::StartCu)).collect();
    assert_eq!(pool.allocations(id), allocated);
    drop(again);
    assert_eq!(fx.sim.exec_buffer_allocations(), allocated);
    fx.runtime.shutdown().unwrap();
}

#[test]
fn test_payload_untouched_on_every_backend() {
    for fx in [
        Fixture::sws(6, CompletionMode::Immediate),
        Fixture::kds(6, CompletionMode::Immediate),
        Fixture::mbs(6, CompletionMode::Immediate),
    ] {
        let cmd = fx.command(Opcode::StartCu);
        cmd.set_cu_mask(&[2, 5]).unwrap();
        cmd.set_payload(3, 0xDEADBEEF).unwrap();
        assert_eq!(cmd.cu_mask_words(), vec![(1 << 2) | (1 << 5)]);

        cmd.run().unwrap();
        assert_eq!(cmd.wait(None).unwrap(), CommandState::Completed);
        assert_eq!(cmd.payload(3).unwrap(), 0xDEADBEEF);
        assert_eq!(cmd.cu_indices(), vec![2, 5]);

        if fx.runtime.scheduler().kind() == accel_sched::BackendKind::Sws {
            // The lowest ready CU of the mask runs the command.
            assert_eq!(fx.sim.cu_starts(2), 1);
            assert_eq!(fx.sim.cu_regmap(2)[3], 0xDEADBEEF);
        }
        fx.runtime.shutdown().unwrap();
    }
}

#[test]
fn test_cu_mask_spans_words() {
    let fx = Fixture::sws(1, CompletionMode::Immediate);
    let cmd = fx.command(Opcode::StartCu);
    cmd.set_cu_mask(&[0, 40]).unwrap();
    assert_eq!(cmd.num_cu_masks(), 2);
    assert_eq!(cmd.header().extra_cu_masks(), 1);
    assert_eq!(cmd.cu_mask_words(), vec![1, 1 << 8]);
    assert_eq!(cmd.cu_indices(), vec![0, 40]);
}

#[test]
fn test_callback_after_completion() {
    let fx = Fixture::sws(1, CompletionMode::Immediate);
    let cmd = fx.command(Opcode::StartCu);
    cmd.set_cu_mask(&[0]).unwrap();
    cmd.run().unwrap();
    assert_eq!(cmd.wait(None).unwrap(), CommandState::Completed);

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    cmd.add_callback(move |state| {
        assert_eq!(state, CommandState::Completed);
        seen.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    fx.runtime.shutdown().unwrap();
}

#[test]
fn test_callback_on_unmanaged_run_rejected() {
    let fx = Fixture::sws(1, CompletionMode::Manual);
    let cmd = fx.command(Opcode::StartCu);
    cmd.set_cu_mask(&[0]).unwrap();
    cmd.run().unwrap();
    assert!(matches!(
        cmd.add_callback(|_| {}),
        Err(ExecError::CallbackOnUnmanaged(_))
    ));

    assert!(eventually(WAIT, || fx.sim.cu_running(0) == 1));
    fx.sim.complete_cu(0);
    assert_eq!(cmd.wait(None).unwrap(), CommandState::Completed);
    fx.runtime.shutdown().unwrap();
}

#[test]
fn test_kernel_instance_selection() {
    let fx = Fixture::sws(4, CompletionMode::Immediate);
    let kernel = fx.kernel("vadd:{vadd_1,vadd_3}", AccessMode::Shared);
    assert_eq!(kernel.cu_indices(), &[0, 2]);
    assert_eq!(kernel.regmap_words(), 17);
    assert_eq!(kernel.args().len(), 6);

    assert_eq!(kernel.group_id(0).unwrap(), 2);
    assert_eq!(kernel.group_id(2).unwrap(), 33);
    assert!(kernel.group_id(3).is_err());
    assert_eq!(kernel.arg_offset(3).unwrap(), 0x34);

    let all = fx.kernel("vadd", AccessMode::Shared);
    assert_eq!(all.cu_indices(), &[0, 1, 2, 3]);

    let missing = Kernel::open(
        &fx.runtime,
        &fx.device,
        &fx.sim.uuid(),
        "vadd:{vadd_9}",
        AccessMode::Shared,
    );
    assert!(matches!(missing, Err(ExecError::KernelNotFound(_))));
}

#[test]
fn test_kernel_contexts_are_shared() {
    let fx = Fixture::sws(2, CompletionMode::Immediate);
    let a = fx.kernel("vadd", AccessMode::Shared);
    let opens = fx.sim.context_opens();
    // Virtual CU plus one context per CU.
    assert_eq!(opens, 3);

    let b = fx.kernel("vadd", AccessMode::Shared);
    assert_eq!(fx.sim.context_opens(), opens);

    let err = Kernel::open(
        &fx.runtime,
        &fx.device,
        &fx.sim.uuid(),
        "vadd:{vadd_1}",
        AccessMode::Exclusive,
    )
    .unwrap_err();
    assert!(matches!(err, ExecError::ConflictingAccess { cu: 0, .. }));

    drop(a);
    assert_eq!(fx.sim.context_closes(), 0);
    drop(b);
    assert_eq!(fx.sim.context_closes(), 3);

    // Nothing holds CU 0 any more.
    let _exclusive = fx.kernel("vadd:{vadd_1}", AccessMode::Exclusive);
}

#[test]
fn test_run_arguments_reach_the_cu() {
    let fx = Fixture::sws(1, CompletionMode::Immediate);
    let kernel = fx.kernel("vadd", AccessMode::Shared);
    let run = Run::new(&kernel).unwrap();

    run.set_arg(0, ArgValue::Buffer(0x2_0000_1000)).unwrap();
    run.set_arg(3, ArgValue::Scalar(&42u32.to_le_bytes())).unwrap();
    run.set_arg(5, ArgValue::Null).unwrap();
    assert!(run.set_arg(3, ArgValue::Scalar(&[1, 2])).is_err());
    assert!(run.set_arg(6, ArgValue::Null).is_err());

    let cmd = run.command();
    assert_eq!(cmd.payload(4).unwrap(), 0x1000);
    assert_eq!(cmd.payload(5).unwrap(), 0x2);
    assert_eq!(cmd.payload(13).unwrap(), 42);

    run.start().unwrap();
    assert_eq!(run.wait(None).unwrap(), CommandState::Completed);
    assert_eq!(run.state(), CommandState::Completed);

    // Shared access still allows reading arguments back.
    assert_eq!(run.get_arg(3).unwrap(), vec![42]);
    assert_eq!(run.get_arg(0).unwrap(), vec![0x1000, 0x2]);
    fx.runtime.shutdown().unwrap();
}

#[test]
fn test_register_access_rules() {
    let fx = Fixture::sws(2, CompletionMode::Immediate);

    let multi = fx.kernel("vadd", AccessMode::Shared);
    assert!(matches!(multi.read_register(0x34), Err(ExecError::AccessDenied(_))));
    drop(multi);

    let shared = fx.kernel("vadd:{vadd_2}", AccessMode::Shared);
    assert!(matches!(shared.write_register(0x34, 1), Err(ExecError::AccessDenied(_))));
    drop(shared);

    let exclusive = fx.kernel("vadd:{vadd_2}", AccessMode::Exclusive);
    exclusive.write_register(0x34, 77).unwrap();
    assert_eq!(exclusive.read_register(0x34).unwrap(), 77);
    assert!(exclusive.read_register(0xfffc).is_ok());
    assert!(matches!(
        exclusive.read_register(0x10000),
        Err(ExecError::InvalidArgument(_))
    ));
    fx.runtime.shutdown().unwrap();
}

#[test]
fn test_register_access_with_rw_shared() {
    let fx = Fixture::new(
        SchedConfig::default().with_rw_shared(true),
        1,
        CompletionMode::Immediate,
    );
    let kernel = fx.kernel("vadd", AccessMode::Shared);
    kernel.write_register(0x10, 5).unwrap();
    assert_eq!(kernel.read_register(0x10).unwrap(), 5);
    fx.runtime.shutdown().unwrap();
}
