use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;

use runnel_core::config::EngineConfig;
use runnel_core::error::RunnelError;
use runnel_core::types::{OrchestrationEvent, RunStatus, StrandedJoin};
use runnel_engine::{
    Advancer, BatchInvocation, CombinationalWaiter, Combined, Invocation, Orchestration,
    OrchestrationBuilder, Orchestrator, Runnable,
};

fn recording() -> EngineConfig {
    EngineConfig {
        record_steps: true,
        ..EngineConfig::default()
    }
}

fn drain(rx: &mut broadcast::Receiver<OrchestrationEvent>) -> Vec<OrchestrationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn add_one(name: &str, delta: i64) -> Runnable {
    Runnable::new(name, move |inv: Invocation<i64>| async move { Ok(inv.input() + delta) })
}

/// A parses a string, advances to B only for positive numbers.
fn parse_then_format() -> Orchestration<String, String> {
    let mut builder = OrchestrationBuilder::<String, String>::new("parse-format");
    let a = builder
        .add(Runnable::new("A", |inv: Invocation<String>| async move {
            inv.input()
                .trim()
                .parse::<i64>()
                .map_err(|e| RunnelError::work("A", e.to_string()))
        }))
        .unwrap();
    let b = builder
        .add(
            Runnable::new("B", |inv: Invocation<i64>| async move {
                Ok(format!("value {}", inv.input()))
            })
            .allow_dead_end(),
        )
        .unwrap();
    builder
        .advance(&a, Advancer::when::<i64, _>(&b, |x| *x > 0).unwrap())
        .unwrap();
    builder.set_entry(&a).unwrap();
    builder.set_result(&b).unwrap();
    builder.build().unwrap()
}

#[tokio::test]
async fn test_positive_input_reaches_dead_end() {
    let mut orchestrator = Orchestrator::with_config(parse_then_format(), recording());
    let report = orchestrator.invoke("5".to_string()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.ticks, 2);
    assert_eq!(report.invocations, 2);
    assert!(report.dropped.is_empty());

    let trace = orchestrator.trace();
    let b_records: Vec<_> = trace.for_runnable("B").collect();
    assert_eq!(b_records.len(), 1);
    assert_eq!(b_records[0].input, "5");

    let a_record = trace.for_runnable("A").next().unwrap();
    assert_eq!(a_record.transitions.len(), 1);
    assert_eq!(a_record.transitions[0].to, "B");
    assert_eq!(a_record.transitions[0].output, "5");

    let results: Vec<String> = orchestrator.results().iter().map(|s| s.to_string()).collect();
    assert_eq!(results, vec!["value 5"]);
}

#[tokio::test]
async fn test_unmatched_output_retried_then_dropped() {
    let mut orchestrator = Orchestrator::with_config(parse_then_format(), recording());
    let mut rx = orchestrator.subscribe();
    let report = orchestrator.invoke("-1".to_string()).await.unwrap();

    assert!(report.is_completed());
    assert_eq!(orchestrator.trace().for_runnable("A").count(), 3);
    assert_eq!(orchestrator.trace().for_runnable("B").count(), 0);
    assert!(orchestrator.results().is_empty());

    assert_eq!(report.dropped.len(), 1);
    assert_eq!(report.dropped[0].runnable, "A");
    assert_eq!(report.dropped[0].attempts, 3);
    assert!(!report.dropped[0].errored);

    let events = drain(&mut rx);
    let dropped = events
        .iter()
        .filter(|e| matches!(e, OrchestrationEvent::BranchDropped { .. }))
        .count();
    assert_eq!(dropped, 1);
}

#[tokio::test]
async fn test_failed_invocation_takes_retry_path() {
    let mut orchestrator = Orchestrator::with_config(parse_then_format(), recording());
    let mut rx = orchestrator.subscribe();
    let report = orchestrator.invoke("not a number".to_string()).await.unwrap();

    assert!(report.is_completed());
    assert_eq!(report.dropped.len(), 1);
    assert!(report.dropped[0].errored);

    let records: Vec<_> = orchestrator.trace().for_runnable("A").collect();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.output.is_none() && r.error.is_some()));

    let failures = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, OrchestrationEvent::InvocationFailed { .. }))
        .count();
    assert_eq!(failures, 3);
}

#[tokio::test]
async fn test_retry_bound_per_runnable() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut builder = OrchestrationBuilder::<i64, i64>::new("never");
    let stuck = builder
        .add(
            Runnable::new("stuck", move |inv: Invocation<i64>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    inv.report_usage(2);
                    Ok(*inv.input())
                }
            })
            .with_max_reruns(5),
        )
        .unwrap();
    let sink = builder.add(add_one("sink", 0).allow_dead_end()).unwrap();
    builder
        .advance(&stuck, Advancer::when::<i64, _>(&sink, |_| false).unwrap())
        .unwrap();
    builder.set_entry(&stuck).unwrap();
    builder.set_result(&sink).unwrap();

    let mut orchestrator = Orchestrator::new(builder.build().unwrap());
    let report = orchestrator.invoke(1).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(report.ticks, 5);
    assert_eq!(report.dropped[0].attempts, 5);
    // usage of every attempt stays with the dropped branch
    assert_eq!(report.dropped[0].usage, 10);
    assert_eq!(report.usage, 10);
}

#[tokio::test]
async fn test_batch_reruns_each_process_up_to_its_own_bound() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut builder = OrchestrationBuilder::<i64, i64>::new("stuck-batch");
    let fan = builder.add(add_one("fan", 0).parallel_advances()).unwrap();
    let first = builder.add(add_one("delay0", 0)).unwrap();
    let second = builder.add(add_one("delay1", 0)).unwrap();
    let counter = Arc::clone(&calls);
    let stuck = builder
        .add(Runnable::batched(
            "stuck",
            move |batch: BatchInvocation<i64>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(batch.len() as i64)
                }
            },
        ))
        .unwrap();
    let sink = builder.add(add_one("sink", 0).allow_dead_end()).unwrap();

    builder
        .advance(&fan, Advancer::always::<i64>(&stuck).unwrap())
        .unwrap();
    builder
        .advance(&fan, Advancer::always::<i64>(&first).unwrap())
        .unwrap();
    builder
        .advance(&first, Advancer::always::<i64>(&second).unwrap())
        .unwrap();
    builder
        .advance(&second, Advancer::always::<i64>(&stuck).unwrap())
        .unwrap();
    builder
        .advance(&stuck, Advancer::when::<i64, _>(&sink, |_| false).unwrap())
        .unwrap();
    builder.set_entry(&fan).unwrap();
    builder.set_result(&sink).unwrap();

    let mut orchestrator = Orchestrator::new(builder.build().unwrap());
    let report = orchestrator.invoke(0).await.unwrap();
    assert!(report.is_completed());

    // the late process joins the batch on the early one's last attempt
    let attempts: Vec<u32> = report.dropped.iter().map(|b| b.attempts).collect();
    assert_eq!(attempts, vec![3, 3]);
    assert!(report.dropped.iter().all(|b| b.runnable == "stuck"));
    // ticks 2..=6, the fourth shared by both processes
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_dead_end_runs_once() {
    let mut builder = OrchestrationBuilder::<i64, i64>::new("single");
    let only = builder.add(add_one("only", 1).allow_dead_end()).unwrap();
    builder.set_entry(&only).unwrap();
    builder.set_result(&only).unwrap();

    let mut orchestrator = Orchestrator::new(builder.build().unwrap());
    let mut rx = orchestrator.subscribe();
    let report = orchestrator.invoke(41).await.unwrap();

    assert_eq!(report.invocations, 1);
    assert!(report.dropped.is_empty());
    assert_eq!(*orchestrator.results()[0], 42);

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(OrchestrationEvent::RunStarted { .. })));
    assert!(matches!(events.last(), Some(OrchestrationEvent::RunComplete { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::BranchEnded { runnable, .. } if runnable == "only")));
}

#[tokio::test]
async fn test_missing_advancers_fail_at_first_advancement() {
    let mut builder = OrchestrationBuilder::<i64, i64>::new("broken");
    let lonely = builder.add(add_one("lonely", 0)).unwrap();
    builder.set_entry(&lonely).unwrap();
    builder.set_result(&lonely).unwrap();

    let mut orchestrator = Orchestrator::new(builder.build().unwrap());
    let mut rx = orchestrator.subscribe();
    let err = orchestrator.invoke(1).await.unwrap_err();

    assert!(matches!(err, RunnelError::NoAdvancers(ref name) if name == "lonely"));
    assert!(!orchestrator.is_completed());
    assert!(matches!(
        drain(&mut rx).last(),
        Some(OrchestrationEvent::RunError { .. })
    ));
}

/// split fans out to left and right, which both feed merge.
fn diamond(batched_merge: bool) -> Orchestration<i64, Vec<i64>> {
    let mut builder = OrchestrationBuilder::<i64, Vec<i64>>::new("diamond");
    let split = builder.add(add_one("split", 0).parallel_advances()).unwrap();
    let left = builder.add(add_one("left", 1)).unwrap();
    let right = builder.add(add_one("right", 2)).unwrap();

    let merge = if batched_merge {
        Runnable::batched("merge", |batch: BatchInvocation<i64>| async move {
            let mut values: Vec<i64> = batch.inputs().iter().map(|v| **v).collect();
            values.sort();
            Ok(values)
        })
    } else {
        Runnable::new("merge", |inv: Invocation<i64>| async move { Ok(vec![*inv.input()]) })
    };
    let merge = builder.add(merge.allow_dead_end()).unwrap();

    builder
        .advance(&split, Advancer::always::<i64>(&left).unwrap())
        .unwrap();
    builder
        .advance(&split, Advancer::always::<i64>(&right).unwrap())
        .unwrap();
    builder
        .advance(&left, Advancer::always::<i64>(&merge).unwrap())
        .unwrap();
    builder
        .advance(&right, Advancer::always::<i64>(&merge).unwrap())
        .unwrap();
    builder.set_entry(&split).unwrap();
    builder.set_result(&merge).unwrap();
    builder.build().unwrap()
}

#[tokio::test]
async fn test_fan_in_invokes_batched_runnable_once() {
    let mut orchestrator = Orchestrator::new(diamond(true));
    let report = orchestrator.invoke(10).await.unwrap();

    assert_eq!(report.ticks, 3);
    assert_eq!(report.invocations, 4);
    let results = orchestrator.results();
    assert_eq!(results.len(), 1);
    assert_eq!(*results[0], vec![11, 12]);
}

#[tokio::test]
async fn test_fan_in_activates_runnable_once_per_tick() {
    let mut orchestrator = Orchestrator::new(diamond(false));
    let mut rx = orchestrator.subscribe();
    let report = orchestrator.invoke(10).await.unwrap();
    assert_eq!(report.ticks, 3);

    let third_tick = drain(&mut rx).into_iter().find_map(|e| match e {
        OrchestrationEvent::TickStarted { tick: 3, active, .. } => Some(active),
        _ => None,
    });
    assert_eq!(third_tick, Some(vec!["merge".to_string()]));

    let mut merged: Vec<i64> = orchestrator.results().iter().map(|v| v[0]).collect();
    merged.sort();
    assert_eq!(merged, vec![11, 12]);
}

/// Three branches of different lengths joined by a waiter requiring all three.
fn staggered_join(lengths: [usize; 3]) -> Orchestration<i64, i64> {
    let mut builder = OrchestrationBuilder::<i64, i64>::new("join");
    let fan = builder.add(add_one("fan", 0).parallel_advances()).unwrap();
    let join = builder
        .add(CombinationalWaiter::<i64>::new("join", 3).into_runnable())
        .unwrap();
    let sum = builder.add(add_one("sum", 0).allow_dead_end()).unwrap();

    for (branch, length) in lengths.iter().enumerate() {
        let mut previous = fan.clone();
        for hop in 0..*length {
            let delta = if hop == 0 { 10_i64.pow(branch as u32) } else { 0 };
            let node = builder
                .add(add_one(&format!("branch{}-{}", branch, hop), delta))
                .unwrap();
            builder
                .advance(&previous, Advancer::always::<i64>(&node).unwrap())
                .unwrap();
            previous = node;
        }
        builder
            .advance(&previous, Advancer::always::<i64>(&join).unwrap())
            .unwrap();
    }

    builder
        .advance(
            &join,
            CombinationalWaiter::<i64>::advance_with(&sum, |c: &Combined<i64>| {
                c.items().iter().map(|v| **v).sum::<i64>()
            })
            .unwrap(),
        )
        .unwrap();
    builder.set_entry(&fan).unwrap();
    builder.set_result(&sum).unwrap();
    builder.build().unwrap()
}

#[tokio::test]
async fn test_join_waits_for_all_branches_across_ticks() {
    let mut orchestrator = Orchestrator::with_config(staggered_join([1, 2, 3]), recording());
    let report = orchestrator.invoke(0).await.unwrap();
    assert!(report.is_completed());

    // branches contribute 1, 10 and 100
    let results: Vec<i64> = orchestrator.results().iter().map(|v| **v).collect();
    assert_eq!(results, vec![111]);

    let trace = orchestrator.trace();
    assert_eq!(trace.for_runnable("sum").count(), 1);
    assert_eq!(trace.for_runnable("join").count(), 3);

    let counts: Vec<usize> = orchestrator
        .outputs_of("join")
        .iter()
        .filter_map(|v| v.downcast_ref::<Combined<i64>>())
        .map(|c| c.count())
        .collect();
    assert_eq!(counts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_join_is_independent_of_arrival_order() {
    let mut orchestrator = Orchestrator::with_config(staggered_join([3, 1, 2]), recording());
    let report = orchestrator.invoke(0).await.unwrap();
    assert!(report.is_completed());

    let results: Vec<i64> = orchestrator.results().iter().map(|v| **v).collect();
    assert_eq!(results, vec![111]);

    let counts: Vec<usize> = orchestrator
        .outputs_of("join")
        .iter()
        .filter_map(|v| v.downcast_ref::<Combined<i64>>())
        .map(|c| c.count())
        .collect();
    assert_eq!(counts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_join_fires_when_all_arrive_together() {
    let mut orchestrator = Orchestrator::with_config(staggered_join([1, 1, 1]), recording());
    orchestrator.invoke(0).await.unwrap();

    // one batched invocation, recorded once per joined process
    assert_eq!(orchestrator.outputs_of("join").len(), 1);
    assert_eq!(orchestrator.trace().for_runnable("join").count(), 3);
    let results: Vec<i64> = orchestrator.results().iter().map(|v| **v).collect();
    assert_eq!(results, vec![111]);
}

#[tokio::test]
async fn test_partial_join_never_advances() {
    let mut builder = OrchestrationBuilder::<i64, i64>::new("short");
    let fan = builder.add(add_one("fan", 0).parallel_advances()).unwrap();
    let only = builder.add(add_one("only", 1)).unwrap();
    let join = builder
        .add(CombinationalWaiter::<i64>::new("join", 2).into_runnable())
        .unwrap();
    let sum = builder.add(add_one("sum", 0).allow_dead_end()).unwrap();
    builder
        .advance(&fan, Advancer::always::<i64>(&only).unwrap())
        .unwrap();
    builder
        .advance(&only, Advancer::always::<i64>(&join).unwrap())
        .unwrap();
    builder
        .advance(
            &join,
            CombinationalWaiter::<i64>::advance_with(&sum, |c: &Combined<i64>| c.count() as i64)
                .unwrap(),
        )
        .unwrap();
    builder.set_entry(&fan).unwrap();
    builder.set_result(&sum).unwrap();

    let mut orchestrator = Orchestrator::new(builder.build().unwrap());
    let mut rx = orchestrator.subscribe();
    let report = orchestrator.invoke(0).await.unwrap();
    assert!(report.is_completed());
    assert!(report.dropped.is_empty());
    assert!(orchestrator.results().is_empty());

    let stranded = StrandedJoin {
        runnable: "join".to_string(),
        buffered: 1,
    };
    assert_eq!(report.stranded, vec![stranded.clone()]);
    let event = drain(&mut rx).into_iter().find_map(|e| match e {
        OrchestrationEvent::JoinStranded { join, .. } => Some(join),
        _ => None,
    });
    assert_eq!(event, Some(stranded));
}

#[tokio::test]
async fn test_fired_join_is_not_stranded() {
    let mut orchestrator = Orchestrator::new(staggered_join([2, 1, 1]));
    let report = orchestrator.invoke(0).await.unwrap();
    assert!(report.stranded.is_empty());
}

#[test]
fn test_converter_type_checked_at_construction() {
    let mut builder = OrchestrationBuilder::<String, String>::new("typed");
    let text = builder
        .add(
            Runnable::new("text", |inv: Invocation<String>| async move {
                Ok(inv.input().clone())
            })
            .allow_dead_end(),
        )
        .unwrap();
    let number = builder.add(add_one("number", 0)).unwrap();

    let err = Advancer::map::<i64, i64, _>(&text, |x| x + 1).unwrap_err();
    assert!(matches!(err, RunnelError::TypeMismatch { .. }));

    // predicate reads i64 but text outputs String
    let edge = Advancer::always::<i64>(&number).unwrap();
    let err = builder.advance(&text, edge).unwrap_err();
    assert!(err.is_configuration());

    let edge = Advancer::map::<String, i64, _>(&number, |s| s.len() as i64).unwrap();
    assert!(builder.advance(&text, edge).is_ok());
}

fn self_loop(name: &str, pause: Duration) -> Orchestration<i64, i64> {
    let mut builder = OrchestrationBuilder::<i64, i64>::new("loop");
    let spin = builder
        .add(Runnable::new(name, move |inv: Invocation<i64>| async move {
            inv.properties().increment("spins", 1);
            tokio::time::sleep(pause).await;
            Ok(inv.input() + 1)
        }))
        .unwrap();
    builder
        .advance(&spin, Advancer::always::<i64>(&spin).unwrap())
        .unwrap();
    builder.set_entry(&spin).unwrap();
    builder.set_result(&spin).unwrap();
    builder.build().unwrap()
}

#[tokio::test]
async fn test_cancellation_ends_run_at_tick_boundary() {
    let config = EngineConfig {
        max_ticks: 0,
        ..EngineConfig::default()
    };
    let mut orchestrator =
        Orchestrator::with_config(self_loop("spin", Duration::from_millis(2)), config);
    let mut rx = orchestrator.subscribe();
    let token = orchestrator.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
    });

    let report = orchestrator.invoke(0).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(report.ticks >= 1);
    assert!(!orchestrator.is_completed());

    let spins = orchestrator.properties().get_i64("spins").unwrap();
    assert_eq!(spins as u64, report.ticks);

    let exited = drain(&mut rx).into_iter().find_map(|e| match e {
        OrchestrationEvent::RunCancelled { exited, .. } => Some(exited),
        _ => None,
    });
    assert_eq!(exited, Some(vec!["spin".to_string()]));
}

#[tokio::test]
async fn test_in_flight_work_observes_cancellation() {
    let mut builder = OrchestrationBuilder::<i64, i64>::new("patient");
    let wait = builder
        .add(
            Runnable::new("wait", |inv: Invocation<i64>| async move {
                inv.cancellation().cancelled().await;
                Ok(*inv.input())
            })
            .allow_dead_end(),
        )
        .unwrap();
    builder.set_entry(&wait).unwrap();
    builder.set_result(&wait).unwrap();

    let mut orchestrator = Orchestrator::new(builder.build().unwrap());
    let token = orchestrator.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
    });

    let report = orchestrator.invoke(3).await.unwrap();
    // the tick in flight finishes and leaves nothing active
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.ticks, 1);
    assert_eq!(*orchestrator.results()[0], 3);
}

#[tokio::test]
async fn test_finished_run_completes_despite_late_cancel() {
    let mut builder = OrchestrationBuilder::<i64, i64>::new("slow");
    let nap = builder
        .add(
            Runnable::new("nap", |inv: Invocation<i64>| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(*inv.input())
            })
            .allow_dead_end(),
        )
        .unwrap();
    builder.set_entry(&nap).unwrap();
    builder.set_result(&nap).unwrap();

    let mut orchestrator = Orchestrator::new(builder.build().unwrap());
    let mut rx = orchestrator.subscribe();
    let token = orchestrator.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let report = orchestrator.invoke(9).await.unwrap();
    assert!(report.is_completed());
    assert!(orchestrator.is_completed());
    assert_eq!(*orchestrator.results()[0], 9);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::RunComplete { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::RunCancelled { .. })));
}

#[tokio::test]
async fn test_tick_limit_stops_runaway_cycle() {
    let config = EngineConfig {
        max_ticks: 5,
        ..EngineConfig::default()
    };
    let mut orchestrator = Orchestrator::with_config(self_loop("spin", Duration::ZERO), config);
    let err = orchestrator.invoke(0).await.unwrap_err();
    assert!(matches!(err, RunnelError::TickLimitExceeded(5)));
    assert_eq!(orchestrator.properties().get_i64("spins"), Some(5));
}

#[tokio::test]
async fn test_panic_is_isolated_to_its_process() {
    let mut builder = OrchestrationBuilder::<i64, i64>::new("panicky");
    let fan = builder.add(add_one("fan", 0).parallel_advances()).unwrap();
    let boom = builder
        .add(
            Runnable::new("boom", |inv: Invocation<i64>| async move {
                if *inv.input() >= 0 {
                    panic!("boom on {}", inv.input());
                }
                Ok(*inv.input())
            })
            .with_max_reruns(2),
        )
        .unwrap();
    let fine = builder.add(add_one("fine", 1).allow_dead_end()).unwrap();
    builder
        .advance(&fan, Advancer::always::<i64>(&boom).unwrap())
        .unwrap();
    builder
        .advance(&fan, Advancer::always::<i64>(&fine).unwrap())
        .unwrap();
    builder
        .advance(&boom, Advancer::always::<i64>(&fine).unwrap())
        .unwrap();
    builder.set_entry(&fan).unwrap();
    builder.set_result(&fine).unwrap();

    let mut orchestrator = Orchestrator::new(builder.build().unwrap());
    let mut rx = orchestrator.subscribe();
    let report = orchestrator.invoke(1).await.unwrap();

    assert!(report.is_completed());
    assert_eq!(report.dropped.len(), 1);
    assert_eq!(report.dropped[0].runnable, "boom");
    assert_eq!(report.dropped[0].attempts, 2);
    assert!(report.dropped[0].errored);

    let results: Vec<i64> = orchestrator.results().iter().map(|v| **v).collect();
    assert_eq!(results, vec![2]);

    let panicked = drain(&mut rx).into_iter().any(|e| match e {
        OrchestrationEvent::InvocationFailed { error, .. } => error.contains("boom on 1"),
        _ => false,
    });
    assert!(panicked);
}

#[tokio::test]
async fn test_usage_and_properties_are_aggregated() {
    let mut builder = OrchestrationBuilder::<i64, i64>::new("metered");
    let first = builder
        .add(Runnable::new("first", |inv: Invocation<i64>| async move {
            inv.report_usage(3);
            inv.properties().set_str("seen", "first");
            Ok(*inv.input())
        }))
        .unwrap();
    let second = builder
        .add(
            Runnable::new("second", |inv: Invocation<i64>| async move {
                let meter = inv.usage_meter();
                meter.report(4);
                meter.report(1);
                Ok(*inv.input())
            })
            .allow_dead_end(),
        )
        .unwrap();
    builder
        .advance(&first, Advancer::always::<i64>(&second).unwrap())
        .unwrap();
    builder.set_entry(&first).unwrap();
    builder.set_result(&second).unwrap();

    let mut orchestrator = Orchestrator::with_config(builder.build().unwrap(), recording());
    let report = orchestrator.invoke(0).await.unwrap();

    assert_eq!(report.usage, 8);
    assert_eq!(orchestrator.trace().total_usage(), 8);
    assert_eq!(
        orchestrator.properties().get_str("seen").as_deref(),
        Some("first")
    );
}

#[tokio::test]
async fn test_max_concurrency_bounds_parallel_invocations() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut builder = OrchestrationBuilder::<i64, i64>::new("bounded");
    let fan = builder.add(add_one("fan", 0).parallel_advances()).unwrap();
    for i in 0..4 {
        let running = running.clone();
        let peak = peak.clone();
        let worker = builder
            .add(
                Runnable::new(format!("worker{}", i), move |inv: Invocation<i64>| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(*inv.input())
                    }
                })
                .allow_dead_end(),
            )
            .unwrap();
        builder
            .advance(&fan, Advancer::always::<i64>(&worker).unwrap())
            .unwrap();
    }
    builder.set_entry(&fan).unwrap();
    builder.set_result(&fan).unwrap();

    let config = EngineConfig {
        max_concurrency: 1,
        ..EngineConfig::default()
    };
    let mut orchestrator = Orchestrator::with_config(builder.build().unwrap(), config);
    let report = orchestrator.invoke(0).await.unwrap();

    assert_eq!(report.invocations, 5);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

/// Random forward-only graph: every edge points to a later runnable, and a
/// runnable without advancers is a dead end.
fn random_dag(rng: &mut StdRng) -> Orchestration<i64, i64> {
    let size = rng.gen_range(2..8);
    let mut builder = OrchestrationBuilder::<i64, i64>::new("random");
    let mut nodes = Vec::new();
    let mut edges: Vec<Vec<(usize, i64, i64)>> = vec![Vec::new(); size];

    for (i, targets) in edges.iter_mut().enumerate() {
        for j in (i + 1)..size {
            if rng.gen_bool(0.4) {
                let modulus = rng.gen_range(1..4);
                targets.push((j, modulus, rng.gen_range(0..modulus)));
            }
        }
    }

    for (i, targets) in edges.iter().enumerate() {
        let mut runnable = add_one(&format!("n{}", i), i as i64);
        if targets.is_empty() || rng.gen_bool(0.3) {
            runnable = runnable.allow_dead_end();
        }
        if rng.gen_bool(0.5) {
            runnable = runnable.parallel_advances();
        }
        nodes.push(builder.add(runnable).unwrap());
    }

    for (i, targets) in edges.into_iter().enumerate() {
        for (j, modulus, remainder) in targets {
            let edge = Advancer::when::<i64, _>(&nodes[j], move |x| x.rem_euclid(modulus) == remainder)
                .unwrap();
            builder.advance(&nodes[i], edge).unwrap();
        }
    }

    builder.set_entry(&nodes[0]).unwrap();
    builder.set_result(&nodes[size - 1]).unwrap();
    builder.build().unwrap()
}

#[tokio::test]
async fn test_random_dags_terminate() {
    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let graph = random_dag(&mut rng);
        let input = rng.gen_range(-50..50);
        let config = EngineConfig {
            max_reruns: 2,
            ..EngineConfig::default()
        };
        let mut orchestrator = Orchestrator::with_config(graph, config);

        let report = tokio::time::timeout(Duration::from_secs(5), orchestrator.invoke(input))
            .await
            .unwrap_or_else(|_| panic!("seed {} did not terminate", seed))
            .unwrap();
        assert!(report.is_completed(), "seed {}", seed);
    }
}
