//! The reduce / run / check decision tree driving all status transitions.
//!
//! `build` is the single entry point: requesters (the top level and every
//! rule demanding dependencies) intern their keys, get each reduced to a
//! status under the database lock, and either return synchronously or park
//! on a one-shot barrier in the pool's external-blocking slot. Rule
//! execution happens on pool tasks; completions reacquire the lock, commit
//! the terminal status, fire the continuations that accumulated on the
//! `Waiting` entry, and journal the outcome outside the lock.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use grist_error::{GristError, Result, SharedError};
use grist_journal::format::PersistedStatus;
use grist_pool::Pool;
use grist_types::{Assume, BuildResult, Depends, Id, Key, Status, Step, Trace, Value};
use parking_lot::Mutex;
use tracing::debug;

use crate::database::Database;
use crate::map::Core;
use crate::stack::Stack;
use crate::wait::{Barrier, WaitObserver, wait_for};

#[inline]
fn log_reduce_decision(id: Id, decision_reason: &'static str) {
    debug!(id = %id, decision_reason, "reduce decision");
}

/// How the engine probes the external world and runs rules.
pub trait BuildOps: Send + Sync + 'static {
    /// The current on-disk value associated with `key`, or `None` if absent.
    ///
    /// Must not re-enter [`build`]: probes run at points where the engine
    /// holds its own bookkeeping locks.
    fn stored(&self, key: &Key) -> Option<Value>;

    /// Run the rule for `key`. The rule demands dependencies through
    /// [`RuleContext::build`], collecting one [`Depends`] handle per batch,
    /// and reports them back in demand order.
    fn execute(&self, ctx: &RuleContext, key: &Key) -> Result<RuleOutput>;

    /// Values exempt from the post-run stored audit because their rule
    /// rebuilds every run.
    fn always_rebuilds(&self, _value: &Value) -> bool {
        false
    }
}

/// What a rule hands back on success.
#[derive(Debug)]
pub struct RuleOutput {
    pub value: Value,
    /// Dependency groups in the order the rule demanded them.
    pub depends: Vec<Depends>,
    /// Wall seconds the rule spent executing.
    pub execution: f64,
    pub traces: Vec<Trace>,
}

/// Handle given to an executing rule for demanding dependencies.
pub struct RuleContext {
    ctx: Ctx,
    stack: Stack,
}

impl RuleContext {
    /// Demand `keys`, blocking until all are available. The returned
    /// [`BuildOutcome::depends`] is the handle to report in
    /// [`RuleOutput::depends`].
    pub fn build(&self, keys: &[Key]) -> Result<BuildOutcome> {
        build(&self.ctx.pool, &self.ctx.db, &self.ctx.ops, &self.stack, keys)
    }

    /// The demand chain leading to this rule.
    #[must_use]
    pub fn stack(&self) -> &Stack {
        &self.stack
    }
}

/// Successful outcome of [`build`].
#[derive(Debug)]
pub struct BuildOutcome {
    /// Seconds the requester spent blocked on outstanding work.
    pub waited: f64,
    /// The requested ids as one dependency group, in request order.
    pub depends: Depends,
    /// Values in request order.
    pub values: Vec<Value>,
}

/// Everything a detached piece of scheduler work needs to carry.
#[derive(Clone)]
pub(crate) struct Ctx {
    pub(crate) db: Database,
    pub(crate) pool: Arc<Pool>,
    pub(crate) ops: Arc<dyn BuildOps>,
}

/// Outcome kind of [`reduce`]; values and errors are read back from the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reduced {
    Ready,
    Error,
    Waiting,
}

/// Demand `keys` on behalf of `stack`, returning when every one is ready.
///
/// Synchronous when everything is already terminal; otherwise the calling
/// thread parks in the pool's external-blocking slot until the last
/// outstanding dependency fires the barrier.
pub fn build(
    pool: &Arc<Pool>,
    db: &Database,
    ops: &Arc<dyn BuildOps>,
    stack: &Stack,
    keys: &[Key],
) -> Result<BuildOutcome> {
    let ctx = Ctx {
        db: db.clone(),
        pool: Arc::clone(pool),
        ops: Arc::clone(ops),
    };

    let (barrier, ids) = {
        let mut core = db.lock_core();
        let ids: Vec<Id> = keys.iter().map(|key| core.intern(key)).collect();

        if let Some(repeat) = stack.first_on_stack(&ids) {
            let key = core.key(repeat);
            return Err(GristError::recursion(
                db.type_name(key.tag()),
                key.display(),
            ));
        }

        let mut first_error: Option<SharedError> = None;
        let mut all_ready = true;
        for &id in &ids {
            match reduce(&ctx, &mut core, stack, id) {
                Reduced::Ready => {}
                Reduced::Error => {
                    all_ready = false;
                    if first_error.is_none() {
                        first_error = core.error(id);
                    }
                }
                Reduced::Waiting => all_ready = false,
            }
        }
        if let Some(error) = first_error {
            return Err(GristError::Propagated(error));
        }
        if all_ready {
            let values = ids
                .iter()
                .map(|&id| core.result(id).expect("ready carries a result").value.clone())
                .collect();
            return Ok(BuildOutcome {
                waited: 0.0,
                depends: Depends(ids),
                values,
            });
        }

        let barrier = Barrier::new();
        let waiting = dedupe(
            ids.iter()
                .copied()
                .filter(|&id| core.status(id).is_waiting())
                .collect(),
        );
        let observer: WaitObserver = {
            let barrier = Arc::clone(&barrier);
            let ids = ids.clone();
            Arc::new(move |core: &mut Core, is_last: bool, id: Id| {
                if let Some(error) = core.error(id) {
                    barrier.signal(Err(error));
                    return true;
                }
                if is_last {
                    finish_build(core, &ids, &barrier);
                    return true;
                }
                false
            })
        };
        wait_for(&mut core, waiting, observer);
        (barrier, ids)
    };

    let started = Instant::now();
    let outcome = pool.blocking(|| barrier.wait());
    let waited = started.elapsed().as_secs_f64();
    debug!(
        waited,
        keys = keys.len(),
        requester = %stack.top_display(),
        "build resumed"
    );
    match outcome {
        Ok(values) => Ok(BuildOutcome {
            waited,
            depends: Depends(ids),
            values,
        }),
        Err(error) => Err(GristError::Propagated(error)),
    }
}

/// Collect the requested values once the last subject has terminalized.
fn finish_build(core: &Core, ids: &[Id], barrier: &Barrier) {
    let mut values = Vec::with_capacity(ids.len());
    for &id in ids {
        match core.status(id) {
            Status::Ready(result) => values.push(result.value.clone()),
            Status::Error(error) => {
                barrier.signal(Err(Arc::clone(error)));
                return;
            }
            other => {
                barrier.signal(Err(Arc::new(GristError::internal(format!(
                    "build completed with non-terminal status '{}' for {id}",
                    other.kind()
                )))));
                return;
            }
        }
    }
    barrier.signal(Ok(values));
}

/// Decide what to do with `id`: reuse it, recheck its dependencies, or run
/// its rule. Terminal and in-flight statuses are returned as-is.
fn reduce(ctx: &Ctx, core: &mut Core, stack: &Stack, id: Id) -> Reduced {
    match core.status(id) {
        Status::Ready(_) => Reduced::Ready,
        Status::Error(_) => Reduced::Error,
        Status::Waiting(..) => Reduced::Waiting,
        Status::Missing => {
            log_reduce_decision(id, "missing_run");
            run(ctx, core, stack, id, None);
            Reduced::Waiting
        }
        Status::Loaded(result) => {
            let result = result.clone();
            match ctx.db.assume() {
                Some(Assume::Dirty) => {
                    log_reduce_decision(id, "assume_dirty_run");
                    run(ctx, core, stack, id, Some(result));
                    Reduced::Waiting
                }
                Some(Assume::Skip) => {
                    log_reduce_decision(id, "assume_skip_ready");
                    core.set_status(id, Status::Ready(result));
                    Reduced::Ready
                }
                _ => {
                    // Probing here, under the lock, is sanctioned: nothing
                    // else observes Loaded between replay and this reduce.
                    let key = core.key(id).clone();
                    if ctx.ops.stored(&key).as_ref() == Some(&result.value) {
                        log_reduce_decision(id, "stored_match_check");
                        let groups = result.depends.iter().cloned().collect();
                        check(ctx, core, stack, id, key, result, groups)
                    } else {
                        log_reduce_decision(id, "stored_mismatch_run");
                        run(ctx, core, stack, id, Some(result));
                        Reduced::Waiting
                    }
                }
            }
        }
    }
}

/// Install a `Waiting` for `id` and post its execution to the pool.
///
/// The install happens synchronously under the held lock, so a concurrent
/// reducer arriving between dispatch and completion joins the same future
/// instead of dispatching a second run.
fn run(ctx: &Ctx, core: &mut Core, stack: &Stack, id: Id, prior: Option<BuildResult>) {
    core.ensure_waiting(id, prior.clone());
    let key = core.key(id).clone();
    let step = core.step;
    let exec_stack = stack.push(id, key.clone());
    let task_ctx = ctx.clone();
    debug!(id = %id, key = %key, rebuild = prior.is_some(), "run dispatched");
    ctx.pool
        .spawn(move || run_task(task_ctx, id, key, prior, step, exec_stack));
}

/// The pool side of [`run`]: no lock held until commit.
fn run_task(ctx: Ctx, id: Id, key: Key, prior: Option<BuildResult>, step: Step, exec_stack: Stack) {
    // AssumeClean: trust whatever the world currently holds, if anything.
    if ctx.db.assume() == Some(Assume::Clean) {
        if let Some(prior_result) = &prior {
            if let Some(value) = ctx.ops.stored(&key) {
                debug!(id = %id, "assume_clean_stored_shortcut");
                let result = BuildResult {
                    value,
                    ..prior_result.clone()
                };
                commit(&ctx, id, &key, &exec_stack, Ok(result));
                return;
            }
        }
    }

    let rule_ctx = RuleContext {
        ctx: ctx.clone(),
        stack: exec_stack.clone(),
    };
    let outcome = match ctx.ops.execute(&rule_ctx, &key) {
        Ok(output) => {
            let changed = match &prior {
                Some(p) if p.value == output.value => p.changed,
                _ => step,
            };
            Ok(BuildResult {
                value: output.value,
                built: step,
                changed,
                depends: output.depends,
                execution: output.execution,
                traces: output.traces,
            })
        }
        Err(error) => Err(error),
    };
    commit(&ctx, id, &key, &exec_stack, outcome);
}

/// Commit a run's outcome: terminalize under the lock, fire continuations,
/// then journal outside it.
fn commit(ctx: &Ctx, id: Id, key: &Key, exec_stack: &Stack, outcome: Result<BuildResult>) {
    match outcome {
        Ok(result) => {
            {
                let mut core = ctx.db.lock_core();
                core.terminalize(id, Status::Ready(result.clone()));
            }
            ctx.db.journal_append(id, key, PersistedStatus::Loaded(&result));
        }
        Err(error) => {
            {
                let mut core = ctx.db.lock_core();
                let shared = match error {
                    // A failing dependency already wrapped the root cause;
                    // share it as-is to every transitive requester.
                    GristError::Propagated(inner) => inner,
                    other => {
                        let chain = exec_stack
                            .ids()
                            .iter()
                            .rev()
                            .skip(1)
                            .map(|&demander| core.key(demander).display().to_owned())
                            .collect();
                        Arc::new(GristError::execution(key.display(), chain, other))
                    }
                };
                core.terminalize(id, Status::Error(shared));
            }
            ctx.db.journal_append(id, key, PersistedStatus::Missing);
        }
    }
}

/// Recheck `id`'s stored result group by group.
///
/// Groups are processed in demand order; a group only counts as complete
/// when every member has resolved. A dependency that errored, or that came
/// back `Ready` with `changed` strictly after our `built`, invalidates the
/// stored result and sends `id` back through [`run`] with its prior.
fn check(
    ctx: &Ctx,
    core: &mut Core,
    stack: &Stack,
    id: Id,
    key: Key,
    result: BuildResult,
    mut groups: VecDeque<Depends>,
) -> Reduced {
    let child_stack = stack.push(id, key.clone());
    loop {
        let Some(group) = groups.pop_front() else {
            // Every group validated: the stored result is still good. Note
            // `built` keeps its loaded value, which is how later runs and
            // the progress fold tell a reused result from a fresh one.
            log_reduce_decision(id, "check_valid_ready");
            core.terminalize(id, Status::Ready(result));
            return Reduced::Ready;
        };

        let mut invalidated = false;
        let mut outstanding = Vec::new();
        for &dep in group.ids() {
            if dep == id {
                // A recorded self-dependency can only come from a damaged
                // journal; the result is unusable, rebuild it.
                invalidated = true;
                continue;
            }
            match reduce(ctx, core, &child_stack, dep) {
                Reduced::Error => invalidated = true,
                Reduced::Ready => {
                    let dep_changed = core.result(dep).expect("ready carries a result").changed;
                    if dep_changed > result.built {
                        invalidated = true;
                    }
                }
                Reduced::Waiting => outstanding.push(dep),
            }
        }

        if invalidated {
            log_reduce_decision(id, "check_dependency_changed_run");
            run(ctx, core, stack, id, Some(result));
            return Reduced::Waiting;
        }
        if outstanding.is_empty() {
            continue;
        }

        // Park until the group resolves; later requesters join this
        // Waiting, and its continuation list survives any replacement.
        log_reduce_decision(id, "check_suspended");
        core.ensure_waiting(id, Some(result.clone()));
        let observer = check_observer(ctx.clone(), stack.clone(), id, key, result, groups);
        wait_for(core, dedupe(outstanding), observer);
        return Reduced::Waiting;
    }
}

/// Per-completion logic for a suspended [`check`].
///
/// Each firing re-consults the completed dependency: a failure or a
/// too-new `changed` dispatches the rebuild immediately; the last firing
/// resumes `check` over the remaining groups. Either path consumes the
/// observer state, so later firings fall through to no-ops.
fn check_observer(
    ctx: Ctx,
    stack: Stack,
    id: Id,
    key: Key,
    result: BuildResult,
    remaining: VecDeque<Depends>,
) -> WaitObserver {
    let built = result.built;
    let state = Mutex::new(Some((key, result, remaining)));
    Arc::new(move |core: &mut Core, is_last: bool, dep: Id| {
        if state.lock().is_none() {
            return true;
        }
        let dep_invalidates = match core.status(dep) {
            Status::Error(_) => true,
            Status::Ready(dep_result) => dep_result.changed > built,
            // Subjects fire at terminalization, so anything else means the
            // observer outlived its waiting and has nothing left to do.
            _ => return true,
        };
        if dep_invalidates {
            let Some((_, result, _)) = state.lock().take() else {
                return true;
            };
            log_reduce_decision(id, "check_resumed_dependency_changed_run");
            run(&ctx, core, &stack, id, Some(result));
            return true;
        }
        if is_last {
            let Some((key, result, remaining)) = state.lock().take() else {
                return true;
            };
            log_reduce_decision(id, "check_resumed_next_group");
            check(&ctx, core, &stack, id, key, result, remaining);
            return true;
        }
        false
    })
}

fn dedupe(ids: Vec<Id>) -> Vec<Id> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
