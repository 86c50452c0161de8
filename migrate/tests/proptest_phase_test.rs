//! Property tests for the phase state machine and worker placement.
//!
//! Random event sequences must never move a migration backwards except into
//! `Failed` or through an explicit retry, and placement must never pick a
//! worker that is not ready or already full.

use chrono::Utc;
use migrate::error::ExternalError;
use migrate::fleet::{select_worker, Assignment, FleetManager};
use migrate::migration::convergence::{evaluate, ConvergenceDecision};
use migrate::migration::{advance, PhaseEvent, PhasePolicy, TransitionContext};
use migrate::{
    FleetConfig, Migration, MigrationMethod, MigrationPhase, MigrationSpec, ObjectStore,
    Settings, TargetPlacement, WorkerNode, WorkerNodeSpec, WorkerPhase,
};
use proptest::prelude::*;
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

fn external_error(transient: bool) -> ExternalError {
    if transient {
        ExternalError::transient("timeout talking to the datastore")
    } else {
        ExternalError::unrecoverable("disk full")
    }
}

fn phase_event() -> impl Strategy<Value = PhaseEvent> {
    (0u8..18, any::<bool>(), 0u64..2048).prop_map(|(kind, flag, n)| match kind {
        0 => PhaseEvent::Tick,
        1 => PhaseEvent::ValidationPassed,
        2 => PhaseEvent::ValidationFailed("bad spec".to_string()),
        3 => PhaseEvent::PrerequisitesConfirmed {
            disks: vec!["disk-0".to_string()],
        },
        4 => PhaseEvent::PrerequisitesFailed("source VM gone".to_string()),
        5 => PhaseEvent::WorkerAssigned {
            worker: "w1".to_string(),
        },
        6 => PhaseEvent::WorkerUnavailable {
            reason: "fleet full".to_string(),
        },
        7 => PhaseEvent::WorkerLost("worker deleted".to_string()),
        8 => PhaseEvent::StepInProgress,
        9 => PhaseEvent::FullCopyComplete,
        10 => PhaseEvent::ChangedBlockPassComplete {
            remaining_bytes: n * MIB,
        },
        11 => PhaseEvent::CopyFailed(external_error(flag)),
        12 => PhaseEvent::ConversionSucceeded,
        13 => PhaseEvent::ConversionFailed(external_error(flag)),
        14 => PhaseEvent::CutoverExecuted,
        15 => PhaseEvent::CutoverFailed(external_error(flag)),
        16 => PhaseEvent::RetryRequested { generation: n % 4 },
        _ => PhaseEvent::TransientError("rate limited".to_string()),
    })
}

fn worker_phase() -> impl Strategy<Value = WorkerPhase> {
    prop_oneof![
        Just(WorkerPhase::Provisioning),
        Just(WorkerPhase::VMCreated),
        Just(WorkerPhase::Ready),
        Just(WorkerPhase::Ready),
        Just(WorkerPhase::Deleting),
    ]
}

fn fleet() -> impl Strategy<Value = Vec<WorkerNode>> {
    prop::collection::vec((worker_phase(), 1u32..4, 0usize..5), 0..8).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (phase, capacity, active))| {
                let mut node = WorkerNode::new(
                    "ns",
                    &format!("w{}", i),
                    WorkerNodeSpec {
                        capacity: Some(capacity),
                        ..Default::default()
                    },
                );
                node.status.phase = phase;
                node.status.active_migrations =
                    (0..active.min(capacity as usize)).map(|m| format!("m{}-{}", i, m)).collect();
                node
            })
            .collect()
    })
}

fn migration() -> Migration {
    Migration::new(
        "ns",
        "m1",
        MigrationSpec {
            source_vm: "vm-1".to_string(),
            placement: TargetPlacement {
                flavor_id: "m1.large".to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
    )
}

fn load(worker: &WorkerNode) -> f64 {
    worker.active_count() as f64 / worker.capacity(1).max(1) as f64
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn test_phase_rank_never_regresses(events in prop::collection::vec(phase_event(), 1..60)) {
        let settings = Settings::default();
        let policy = PhasePolicy::default();
        let ctx = TransitionContext { settings: &settings, policy: &policy, now: Utc::now() };
        let mut m = migration();

        for event in &events {
            let Ok(t) = advance(&m, event, &ctx) else {
                continue;
            };
            let from = t.from;
            let to = t.to;
            prop_assert!(
                to.rank() >= from.rank()
                    || to == MigrationPhase::Failed
                    || (from == MigrationPhase::Failed && to == MigrationPhase::Pending),
                "{} -> {} on {:?}", from, to, event
            );
            if to.requires_worker() {
                prop_assert!(t.status.assigned_worker.is_some());
            }
            if from == MigrationPhase::Succeeded {
                prop_assert_eq!(to, MigrationPhase::Succeeded);
            }
            if matches!(event, PhaseEvent::TransientError(_)) {
                prop_assert_eq!(to, from);
            }
            m.status = t.status;
        }
    }

    #[test]
    fn test_reapplying_an_event_is_idempotent(
        history in prop::collection::vec(phase_event(), 0..30),
        event in phase_event(),
    ) {
        let settings = Settings::default();
        let policy = PhasePolicy::default();
        let ctx = TransitionContext { settings: &settings, policy: &policy, now: Utc::now() };
        let mut m = migration();
        for past in &history {
            if let Ok(t) = advance(&m, past, &ctx) {
                m.status = t.status;
            }
        }

        // Same record, same event: same outcome, no double counting
        let first = advance(&m, &event, &ctx);
        let second = advance(&m, &event, &ctx);
        prop_assert_eq!(first.is_ok(), second.is_ok());
        prop_assert_eq!(first.as_ref().ok(), second.as_ref().ok());
        if let Ok(t) = first {
            prop_assert!(t.status.convergence.iterations <= m.status.convergence.iterations + 1);
            prop_assert!(t.status.cutover_attempts <= m.status.cutover_attempts + 1);
        }
    }

    #[test]
    fn test_changed_block_loop_terminates(
        threshold in 1u32..=20,
        deltas in prop::collection::vec(0u64..4096, 20),
    ) {
        let settings = Settings {
            changed_blocks_copy_iteration_threshold: threshold,
            ..Default::default()
        };
        let policy = PhasePolicy::default();
        let ctx = TransitionContext { settings: &settings, policy: &policy, now: Utc::now() };

        let mut m = migration();
        m.status.phase = MigrationPhase::CopyingChangedBlocks;
        m.status.assigned_worker = Some("w1".to_string());

        let mut passes = 0;
        for delta in &deltas {
            if m.phase() != MigrationPhase::CopyingChangedBlocks {
                break;
            }
            let event = PhaseEvent::ChangedBlockPassComplete { remaining_bytes: delta * MIB };
            m.status = advance(&m, &event, &ctx).unwrap().status;
            passes += 1;
        }
        prop_assert_eq!(m.phase(), MigrationPhase::ConvertingDisk);
        prop_assert!(passes <= threshold);
    }

    #[test]
    fn test_convergence_decision(
        iterations in 0u32..30,
        threshold in 0u32..25,
        remaining in any::<u64>(),
    ) {
        let cutoff = 64 * MIB;
        let hot = evaluate(iterations, threshold, remaining, cutoff, MigrationMethod::Hot);
        if remaining < cutoff {
            prop_assert_eq!(hot, ConvergenceDecision::Converged);
        } else if iterations >= threshold.max(1) {
            prop_assert_eq!(hot, ConvergenceDecision::IterationCapReached);
        } else {
            prop_assert_eq!(hot, ConvergenceDecision::Continue);
        }

        let cold = evaluate(iterations, threshold, remaining, cutoff, MigrationMethod::Cold);
        prop_assert_eq!(cold, ConvergenceDecision::Converged);
    }
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn test_selection_respects_readiness_and_capacity(workers in fleet()) {
        let eligible: Vec<&WorkerNode> = workers
            .iter()
            .filter(|w| w.is_schedulable() && w.has_capacity(1))
            .collect();

        match select_worker(&workers, 1) {
            Ok(chosen) => {
                prop_assert!(chosen.is_schedulable());
                prop_assert!(chosen.has_capacity(1));
                for other in &eligible {
                    prop_assert!(load(chosen) <= load(other));
                }
            }
            Err(_) => prop_assert!(eligible.is_empty()),
        }
    }

    #[test]
    fn test_acquire_is_idempotent_and_never_overcommits(
        workers in fleet(),
        requests in prop::collection::vec(0usize..6, 1..20),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let config = FleetConfig { auto_scale: false, ..Default::default() };
            let manager = FleetManager::new(Arc::new(ObjectStore::new()), "ns", config);
            for w in workers {
                manager.workers().create(w).unwrap();
            }

            let mut assigned: Vec<(String, String)> = Vec::new();
            for r in requests {
                let migration = format!("req-{}", r);
                if let Assignment::Assigned { worker } = manager.acquire_worker(&migration).await.unwrap() {
                    if let Some((_, earlier)) = assigned.iter().find(|(m, _)| *m == migration) {
                        prop_assert_eq!(earlier, &worker);
                    } else {
                        assigned.push((migration, worker));
                    }
                }
            }

            for node in manager.list() {
                prop_assert!(node.active_count() <= node.capacity(1) as usize);
            }
            Ok(())
        })?;
    }
}
