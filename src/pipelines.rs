//! Bundled demo orchestrations for the CLI.

use clap::ValueEnum;

use runnel_core::error::{Result, RunnelError};
use runnel_engine::{
    Advancer, BatchInvocation, CombinationalWaiter, Combined, Invocation, Orchestration,
    OrchestrationBuilder, Runnable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Pipeline {
    /// Parse a number and format it when positive
    Parse,
    /// Three branches of different lengths joined into a total
    Join,
    /// Classify a number along every matching branch, then collect
    Fanout,
}

impl Pipeline {
    pub fn default_input(self) -> &'static str {
        match self {
            Pipeline::Parse => "5",
            Pipeline::Join => "3",
            Pipeline::Fanout => "12",
        }
    }
}

/// `parse` (String -> i64) advances to `format` only for positive numbers.
/// Anything else is retried until the rerun bound drops the branch.
pub fn parse() -> Result<Orchestration<String, String>> {
    let mut builder = OrchestrationBuilder::<String, String>::new("parse");
    let parse = builder.add(Runnable::new("parse", |inv: Invocation<String>| async move {
        inv.input()
            .trim()
            .parse::<i64>()
            .map_err(|e| RunnelError::work("parse", e.to_string()))
    }))?;
    let format = builder.add(
        Runnable::new("format", |inv: Invocation<i64>| async move {
            Ok(format!("parsed {}", inv.input()))
        })
        .allow_dead_end(),
    )?;

    builder.advance(&parse, Advancer::when::<i64, _>(&format, |x| *x > 0)?)?;
    builder.set_entry(&parse)?;
    builder.set_result(&format)?;
    builder.build()
}

/// `fan` feeds `double`, `square -> settle` and `negate`; the `join` waiter
/// holds back until all three arrive and hands their sum to `total`.
pub fn join() -> Result<Orchestration<i64, i64>> {
    let mut builder = OrchestrationBuilder::<i64, i64>::new("join");
    let fan = builder.add(
        Runnable::new("fan", |inv: Invocation<i64>| async move { Ok(*inv.input()) })
            .parallel_advances(),
    )?;
    let double = builder.add(Runnable::new("double", |inv: Invocation<i64>| async move {
        inv.report_usage(1);
        Ok(inv.input() * 2)
    }))?;
    let square = builder.add(Runnable::new("square", |inv: Invocation<i64>| async move {
        inv.report_usage(2);
        Ok(inv.input() * inv.input())
    }))?;
    let settle = builder.add(Runnable::new("settle", |inv: Invocation<i64>| async move {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        Ok(*inv.input())
    }))?;
    let negate = builder.add(Runnable::new("negate", |inv: Invocation<i64>| async move {
        Ok(-inv.input())
    }))?;
    let join = builder.add(CombinationalWaiter::<i64>::new("join", 3).into_runnable())?;
    let total = builder.add(
        Runnable::new("total", |inv: Invocation<i64>| async move { Ok(*inv.input()) })
            .allow_dead_end(),
    )?;

    builder.advance(&fan, Advancer::always::<i64>(&double)?)?;
    builder.advance(&fan, Advancer::always::<i64>(&square)?)?;
    builder.advance(&fan, Advancer::always::<i64>(&negate)?)?;
    builder.advance(&square, Advancer::always::<i64>(&settle)?)?;
    builder.advance(&double, Advancer::always::<i64>(&join)?)?;
    builder.advance(&settle, Advancer::always::<i64>(&join)?)?;
    builder.advance(&negate, Advancer::always::<i64>(&join)?)?;
    builder.advance(
        &join,
        CombinationalWaiter::<i64>::advance_with(&total, |c: &Combined<i64>| {
            c.items().iter().map(|v| **v).sum::<i64>()
        })?,
    )?;
    builder.set_entry(&fan)?;
    builder.set_result(&total)?;
    builder.build()
}

/// `classify` fires every matching advancer; the labels meet again in the
/// batched `collect`, which runs once for all of them.
pub fn fanout() -> Result<Orchestration<i64, String>> {
    let mut builder = OrchestrationBuilder::<i64, String>::new("fanout");
    let classify = builder.add(
        Runnable::new("classify", |inv: Invocation<i64>| async move {
            inv.properties().increment("classified", 1);
            Ok(*inv.input())
        })
        .parallel_advances(),
    )?;
    let label = |name: &'static str| {
        Runnable::new(name, move |inv: Invocation<i64>| async move {
            Ok(format!("{} {}", inv.input(), name))
        })
    };
    let even = builder.add(label("even"))?;
    let large = builder.add(label("large"))?;
    let seen = builder.add(label("seen"))?;
    let collect = builder.add(
        Runnable::batched("collect", |batch: BatchInvocation<String>| async move {
            let mut labels: Vec<String> = batch.inputs().iter().map(|s| s.to_string()).collect();
            labels.sort();
            Ok(labels.join(", "))
        })
        .allow_dead_end(),
    )?;

    builder.advance(&classify, Advancer::when::<i64, _>(&even, |x| x % 2 == 0)?)?;
    builder.advance(&classify, Advancer::when::<i64, _>(&large, |x| *x > 10)?)?;
    builder.advance(&classify, Advancer::always::<i64>(&seen)?)?;
    for node in [&even, &large, &seen] {
        builder.advance(node, Advancer::always::<String>(&collect)?)?;
    }
    builder.set_entry(&classify)?;
    builder.set_result(&collect)?;
    builder.build()
}
