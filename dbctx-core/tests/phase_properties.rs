//! Property tests over random lifecycle operation sequences.
//!
//! This test suite covers:
//! - Generation monotonicity and its relation to successful connects
//! - Post-invalidation state (fresh and connected, or disconnected)
//! - Defaults applied exactly once per generation

mod common;

use common::{mock_config, mock_source};
use dbctx_core::{ContextState, ProgressMonitor, SessionPurpose};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    OpenSession,
    KillLinks,
    RefuseConnects(bool),
    Probe,
    Invalidate,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::OpenSession),
        2 => Just(Op::KillLinks),
        1 => any::<bool>().prop_map(Op::RefuseConnects),
        2 => Just(Op::Probe),
        4 => Just(Op::Invalidate),
    ]
}

fn schema_restores(executed: &[String]) -> u64 {
    executed
        .iter()
        .filter(|sql| sql.as_str() == "SET SCHEMA \"public\"")
        .count() as u64
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_invalidation_invariants(ops in proptest::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let (source, backend, _) = mock_source(mock_config());
            let monitor = ProgressMonitor::new();
            let context = source.open_context("Main", &monitor).await.unwrap();
            let mut last_generation = context.generation();

            for op in ops {
                match op {
                    Op::OpenSession => {
                        let result =
                            context.open_session(SessionPurpose::UserQuery, "q", &monitor);
                        prop_assert_eq!(result.is_ok(), context.is_connected());
                    }
                    Op::KillLinks => backend.kill_links(),
                    Op::RefuseConnects(refuse) => backend.refuse_connects(refuse),
                    Op::Probe => {
                        let was_connected = context.is_connected();
                        let _ = context.check_context_alive(&monitor).await;
                        prop_assert_eq!(context.is_connected(), was_connected);
                    }
                    Op::Invalidate => match context.invalidate_full(&monitor).await {
                        Ok(_) => {
                            prop_assert!(context.is_connected());
                            prop_assert!(context.is_fresh());
                            prop_assert_eq!(
                                schema_restores(&backend.executed()),
                                context.generation()
                            );
                        }
                        Err(e) => {
                            prop_assert_eq!(context.state(), ContextState::Disconnected);
                            prop_assert!(e.phase().is_some());
                        }
                    },
                }

                let generation = context.generation();
                prop_assert!(generation >= last_generation);
                prop_assert!(generation <= backend.connect_count() as u64);
                last_generation = generation;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
