//! Integration test: readers preempted inside a read-side section
//!
//! A reader switched out mid-section is parked on its leaf and holds up
//! exactly the grace periods that started before it left the CPU.
//!
//! Run: cargo test -p frankenrcu-core --test preempted_reader_test

use frankenrcu_core::{ExecContext, RcuConfig, RcuState, TaskRef, TraceKind};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// 4 CPUs, fanout 2: root 0, leaf 1 = CPUs 0-1, leaf 2 = CPUs 2-3.
fn four_cpu_tree() -> RcuState {
    RcuState::new(RcuConfig::with_cpus(4, 2).trace_capacity(1024)).unwrap()
}

/// Tick and run core processing on each CPU once.
fn quiesce(rsp: &RcuState, cpus: &[usize]) {
    for &cpu in cpus {
        rsp.check_callbacks(cpu);
        rsp.process_callbacks(cpu);
    }
}

/// Start `task` on `cpu`, enter a section and switch it out.
fn preempt_in_section(rsp: &RcuState, cpu: usize, task: &TaskRef) {
    rsp.switch_to(cpu, Some(task.clone()));
    rsp.read_lock(task);
    rsp.switch_to(cpu, None);
}

// ---------------------------------------------------------------------------
// 1. Preempted before the grace period starts
// ---------------------------------------------------------------------------

#[test]
fn preempted_reader_holds_grace_period_until_unlock() {
    let rsp = four_cpu_tree();
    let t0 = rsp.spawn_task();
    preempt_in_section(&rsp, 0, &t0);
    assert!(t0.special().is_blocked());
    assert_eq!(t0.blocked_node(), Some(1));

    assert!(rsp.start_grace_period());
    quiesce(&rsp, &[0, 1, 2, 3]);

    assert_eq!(rsp.batches_completed(), 0, "reader still inside");
    let stats = rsp.stats();
    assert_eq!(stats.nodes[1].qsmask, 0, "every CPU of leaf 1 reported");
    assert_eq!(stats.nodes[1].blocked, [0, 1, 0, 0]);
    assert_eq!(stats.nodes[0].qsmask, 0b01, "leaf 1 has not reported");

    let report = rsp.stall_report();
    assert!(report.cpus.is_empty());
    assert_eq!(report.tasks, vec![(1, t0.id())]);

    // Resume somewhere else and leave.
    rsp.switch_to(3, Some(t0.clone()));
    rsp.read_unlock(&t0);
    assert_eq!(rsp.batches_completed(), 1);
    assert_eq!(t0.blocked_node(), None);
    assert!(t0.special().is_clear());
    assert_eq!(rsp.stats().blocked_tasks(), 0);

    let kinds: Vec<_> = rsp.trace_snapshot().iter().map(|e| e.kind).collect();
    let blocked = kinds.iter().position(|k| *k == TraceKind::TaskBlocked).unwrap();
    let unblocked = kinds.iter().position(|k| *k == TraceKind::TaskUnblocked).unwrap();
    let end = kinds.iter().position(|k| *k == TraceKind::GpEnd).unwrap();
    assert!(blocked < unblocked && unblocked < end);
}

// ---------------------------------------------------------------------------
// 2. Preempted after its CPU already reported
// ---------------------------------------------------------------------------

#[test]
fn reader_preempted_after_cpu_reported_blocks_only_the_next_grace_period() {
    let rsp = four_cpu_tree();
    rsp.start_grace_period();
    quiesce(&rsp, &[0]);

    let t = rsp.spawn_task();
    preempt_in_section(&rsp, 0, &t);
    assert_eq!(rsp.stats().nodes[1].blocked, [1, 0, 0, 0]);

    quiesce(&rsp, &[1, 2, 3]);
    assert_eq!(rsp.batches_completed(), 1, "grace period 1 ignores the reader");

    rsp.start_grace_period();
    quiesce(&rsp, &[0, 1, 2, 3]);
    assert_eq!(rsp.gpnum(), 2);
    assert_eq!(rsp.batches_completed(), 1, "grace period 2 waits for it");

    rsp.read_unlock(&t);
    assert_eq!(rsp.batches_completed(), 2);
}

// ---------------------------------------------------------------------------
// 3. Preempted while its CPU still owes a quiescent state
// ---------------------------------------------------------------------------

#[test]
fn reader_preempted_mid_grace_period_blocks_it() {
    let rsp = four_cpu_tree();
    rsp.start_grace_period();
    let t = rsp.spawn_task();
    preempt_in_section(&rsp, 2, &t);
    assert_eq!(rsp.stats().nodes[2].blocked, [0, 1, 0, 0]);

    quiesce(&rsp, &[0, 1, 2, 3]);
    assert_eq!(rsp.batches_completed(), 0);
    assert_eq!(rsp.stall_report().tasks, vec![(2, t.id())]);

    rsp.read_unlock(&t);
    assert_eq!(rsp.batches_completed(), 1);
}

// ---------------------------------------------------------------------------
// 4. Running reader asked to report at unlock
// ---------------------------------------------------------------------------

#[test]
fn running_reader_reports_at_outermost_unlock() {
    let rsp = four_cpu_tree();
    let t = rsp.spawn_task();
    rsp.switch_to(1, Some(t.clone()));
    rsp.read_lock(&t);
    rsp.read_lock(&t);

    rsp.start_grace_period();
    quiesce(&rsp, &[0, 1, 2, 3]);
    assert!(t.special().needs_qs());
    assert_eq!(rsp.stall_report().cpus, vec![1]);

    rsp.read_unlock(&t);
    assert!(t.special().needs_qs(), "inner unlock does nothing");
    rsp.read_unlock(&t);
    assert!(t.special().is_clear());

    rsp.process_callbacks(1);
    assert_eq!(rsp.batches_completed(), 1);
}

#[test]
fn force_quiescent_state_waits_for_running_reader() {
    let rsp = four_cpu_tree();
    let t = rsp.spawn_task();
    rsp.switch_to(3, Some(t.clone()));
    let section = rsp.read(&t);

    rsp.start_grace_period();
    rsp.force_quiescent_state();
    assert_eq!(rsp.batches_completed(), 0);
    assert!(t.special().needs_qs());

    drop(section);
    rsp.force_quiescent_state();
    assert_eq!(rsp.batches_completed(), 1);
    assert!(rsp.stats().force_qs_passes >= 2);
}

// ---------------------------------------------------------------------------
// 5. Interrupt and NMI context
// ---------------------------------------------------------------------------

#[test]
fn irq_unlock_reports_but_never_dequeues() {
    let rsp = four_cpu_tree();
    let t = rsp.spawn_task();
    preempt_in_section(&rsp, 0, &t);
    rsp.start_grace_period();
    quiesce(&rsp, &[0, 1, 2, 3]);

    rsp.switch_to(0, Some(t.clone()));
    rsp.read_unlock_in(&t, ExecContext::Irq);
    assert!(t.special().is_blocked(), "still queued");
    assert_eq!(rsp.batches_completed(), 0);

    // The next task-context unlock finds the flag and cleans up.
    rsp.read_lock(&t);
    rsp.read_unlock(&t);
    assert_eq!(t.blocked_node(), None);
    assert_eq!(rsp.batches_completed(), 1);
}

#[test]
fn nmi_unlock_leaves_all_work_pending() {
    let rsp = four_cpu_tree();
    let t = rsp.spawn_task();
    rsp.switch_to(1, Some(t.clone()));
    rsp.read_lock(&t);
    rsp.start_grace_period();
    rsp.check_callbacks(1);
    assert!(t.special().needs_qs());

    rsp.read_unlock_in(&t, ExecContext::Nmi);
    assert!(t.special().needs_qs());
    assert_eq!(t.nesting(), 0);
}

// ---------------------------------------------------------------------------
// 6. Task exit
// ---------------------------------------------------------------------------

#[test]
fn exiting_task_leaves_no_blocked_entry() {
    let rsp = four_cpu_tree();
    let t = rsp.spawn_task();
    rsp.switch_to(2, Some(t.clone()));
    rsp.read_lock(&t);
    rsp.read_lock(&t);
    rsp.read_lock(&t);
    rsp.switch_to(2, None);
    rsp.start_grace_period();
    quiesce(&rsp, &[0, 1, 2, 3]);
    assert_eq!(rsp.stats().blocked_tasks(), 1);

    rsp.exit_task(&t);
    assert_eq!(t.nesting(), 0);
    assert_eq!(rsp.stats().blocked_tasks(), 0);
    assert_eq!(rsp.batches_completed(), 1);

    // Exiting outside any section is a no-op.
    rsp.exit_task(&t);
    assert_eq!(t.nesting(), 0);
}

// ---------------------------------------------------------------------------
// 7. Unbalanced unlock
// ---------------------------------------------------------------------------

#[test]
#[should_panic(expected = "without matching read_lock")]
fn unlock_without_lock_panics() {
    let rsp = four_cpu_tree();
    let t = rsp.spawn_task();
    rsp.read_unlock(&t);
}
