// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use slog::{o, Drain};

use exitopt::records::ExitRecord;
use exitopt::stats::ExitOptStats;
use exitopt::usdt::register_probes;
use exitopt::{
    EmCoreState, ExecStatus, ExecutionContext, HistoryConfig, SuppressExits,
};

mod sim;
mod trace;

use sim::{SimExecutor, SimGuest};

#[derive(clap::Parser)]
/// Replay a trace of VM exits through the exit-history optimizer.
struct Args {
    /// TOML configuration of the optimizer.
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// JSON-lines exit trace to replay.
    #[clap(short, long, value_name = "FILE", conflicts_with = "synthetic")]
    trace: Option<PathBuf>,

    /// Replay a synthetic trace with this many exits.
    #[clap(short, long, value_name = "N", default_value_t = 100_000)]
    synthetic: usize,

    /// Handle exits as if in the inner execution context.
    #[clap(long, action)]
    inner: bool,

    /// Instructions between the exits clustered after an exit.
    #[clap(long, default_value_t = 8)]
    cluster_distance: u32,

    /// Number of exits clustered after an exit.
    #[clap(long, default_value_t = 4)]
    cluster_exits: u32,

    /// Make every n-th batch hit an unsupported instruction.
    #[clap(long, value_name = "N")]
    unsupported_every: Option<u64>,

    /// Make every n-th batch defer to the outer loop.
    #[clap(long, value_name = "N")]
    defer_every: Option<u64>,

    /// Emit the results as JSON.
    #[clap(long, action)]
    json: bool,
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

#[derive(Default, Serialize)]
struct Replay {
    exits: u64,
    history_execs: u64,
    continuations: u64,
    failures: u64,
    simulated_instructions: u64,
}

#[derive(Serialize)]
struct Report<'a> {
    replay: &'a Replay,
    stats: &'a ExitOptStats,
    hottest: Vec<&'a ExitRecord>,
}

fn replay(
    em: &mut EmCoreState,
    exits: &[trace::TraceExit],
    ctx: ExecutionContext,
    sim: &mut SimExecutor,
) -> Replay {
    let mut res = Replay::default();
    for exit in exits {
        res.exits += 1;
        let Some(slot) = em.add_exit(exit.tag, exit.pc, exit.timestamp, ctx)
        else {
            continue;
        };

        res.history_execs += 1;
        let mut out = em.history_exec(slot, SuppressExits::all(), ctx, sim);
        if out.continuation {
            // The outer loop has nothing to do for the simulated guest
            // besides picking the probe back up.
            res.continuations += 1;
            if let Some(resumed) = em.resume_continuation(
                ExecStatus::Success,
                SuppressExits::all(),
                sim,
            ) {
                out = resumed;
            }
        }
        if !out.status.is_success() {
            res.failures += 1;
        }
    }
    res.simulated_instructions = sim.instructions;
    res
}

fn print_summary(report: &Report) {
    let Report { replay, stats, hottest } = report;
    println!("exits replayed        {:>12}", replay.exits);
    println!("history executions    {:>12}", replay.history_execs);
    println!("  continuations       {:>12}", replay.continuations);
    println!("  failures            {:>12}", replay.failures);
    println!("record lookups        {:>12}", stats.lookups());
    println!("records in use        {:>12}", stats.records_used);
    println!("probes requested      {:>12}", stats.probes_requested);
    println!("  exec with cap       {:>12}", stats.probed_exec_with_max);
    println!("  normal              {:>12}", stats.probed_normal);
    println!("  to outer loop       {:>12}", stats.probed_to_outer);
    println!("  abandoned           {:>12}", stats.probes_abandoned);
    println!("capped executions     {:>12}", stats.exec);
    println!("  saved exits         {:>12}", stats.exec_saved_exits);
    println!("  instructions        {:>12}", stats.exec_instructions);
    println!("probe instructions    {:>12}", stats.probe_instructions);
    if let Some(mean) = stats.prof_classify.mean() {
        println!("mean classify time    {:>12}", format!("{mean:?}"));
    }

    println!();
    println!("{:>18} {:>14} {:>10} {:>24}", "PC", "TYPE", "HITS", "ACTION");
    for rec in hottest {
        let ty = rec.tag.exit_type().map(|t| t.name()).unwrap_or("?");
        let action = format!("{:?}", rec.action);
        println!(
            "{:>#18x} {:>14} {:>10} {:>24}",
            rec.flat_pc, ty, rec.hits, action
        );
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Ensure proper setup of USDT probes
    register_probes().context("Failed to setup USDT probes")?;

    let (log, _log_async_guard) = build_log();

    let config = match &args.config {
        Some(path) => exitopt_config::parse(path)
            .with_context(|| format!("parsing {}", path.display()))?
            .history_config()?,
        None => HistoryConfig::default(),
    };

    let exits = match &args.trace {
        Some(path) => {
            let fp = File::open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            trace::read(BufReader::new(fp))
                .with_context(|| format!("reading {}", path.display()))?
        }
        None => trace::synthetic(args.synthetic),
    };
    slog::info!(log, "replaying exits"; "count" => exits.len());

    let mut em = EmCoreState::new(config, 0, &log)?;
    let mut sim = SimExecutor::new(SimGuest {
        cluster_distance: args.cluster_distance,
        cluster_exits: args.cluster_exits,
        unsupported_every: args.unsupported_every,
        defer_every: args.defer_every,
    });
    let ctx = if args.inner {
        ExecutionContext::Inner
    } else {
        ExecutionContext::Outer
    };

    let result = replay(&mut em, &exits, ctx, &mut sim);
    slog::info!(log, "replay complete";
        "history_execs" => result.history_execs,
        "failures" => result.failures,
    );

    let mut hottest: Vec<&ExitRecord> =
        em.records().iter().map(|(_, rec)| rec).collect();
    hottest.sort_by(|a, b| b.hits.cmp(&a.hits));
    hottest.truncate(10);

    let report = Report { replay: &result, stats: em.stats(), hottest };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use exitopt::records::ExitAction;

    fn em_state(log: &slog::Logger) -> EmCoreState {
        EmCoreState::new(HistoryConfig::default(), 0, log).unwrap()
    }

    fn sim(cluster_exits: u32) -> SimExecutor {
        SimExecutor::new(SimGuest {
            cluster_distance: 8,
            cluster_exits,
            unsupported_every: None,
            defer_every: None,
        })
    }

    #[test]
    fn synthetic_replay_learns_caps() {
        let log = slog::Logger::root(slog::Discard, o!());
        let mut em = em_state(&log);
        let exits = trace::synthetic(20_000);
        let res = replay(&mut em, &exits, ExecutionContext::Outer, &mut sim(4));

        assert_eq!(res.exits, 20_000);
        assert_eq!(res.failures, 0);
        assert!(res.history_execs > 0);

        let stats = em.stats();
        assert!(stats.probed_exec_with_max >= 4);
        assert!(stats.exec_saved_exits > 0);
        // One per polling loop, unless a record was evicted by the noise
        // and relearned.
        let capped = em
            .records()
            .iter()
            .filter(|(_, rec)| {
                rec.action == ExitAction::ExecuteWithCap { cap: 8 }
            })
            .count();
        assert!(capped >= 4);
        assert!(capped as u64 <= stats.probed_exec_with_max);
    }

    #[test]
    fn deferred_probes_resume() {
        let log = slog::Logger::root(slog::Discard, o!());
        let mut em = em_state(&log);
        let mut sim = SimExecutor::new(SimGuest {
            defer_every: Some(1),
            ..sim(0).guest()
        });
        let exits = trace::synthetic(5_000);
        let res = replay(&mut em, &exits, ExecutionContext::Inner, &mut sim);

        // Every batch defers.  Probes resumed from the outer loop cannot
        // defer again, and settle without having found any clustering.
        assert!(res.continuations > 0);
        assert_eq!(res.failures, 0);
        assert_eq!(em.pending_continuation(), None);
        assert_eq!(em.stats().probed_to_outer, res.continuations);
        assert_eq!(em.stats().probed_normal, res.continuations);
    }

    #[test]
    fn quiet_guest_is_left_alone() {
        let log = slog::Logger::root(slog::Discard, o!());
        let mut em = em_state(&log);
        let exits = trace::synthetic(20_000);
        let res = replay(&mut em, &exits, ExecutionContext::Outer, &mut sim(0));

        let stats = em.stats();
        assert_eq!(stats.probed_exec_with_max, 0);
        assert_eq!(stats.exec, 0);
        assert_eq!(stats.probe, res.history_execs);
        assert_eq!(stats.probed_normal, stats.probe);
    }
}
