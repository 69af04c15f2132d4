//! Off-frame execution of a pass subtree.
//!
//! An [`AsyncGroupHandle`] owns a worker thread that encodes its subtree,
//! submits it and blocks until the GPU is done. `run` never blocks: calls
//! that arrive while a dispatch is in flight are merged into one pending
//! parameter set and dispatched as a single follow-up. A finished result
//! stays "complete" until the frame side acknowledges it with `set_ready`.
//!
//! ```text
//!            run                    finished, nothing pending
//!   Idle ─────────▶ Dispatching ───────────────────────────▶ Complete
//!    ▲               │    ▲  finished, pending                  │ frame observed
//!    │               │    └──────────┐                          ▼
//!    │  failed       │               │               AwaitingConsumption
//!    └───────────────┘               │                          │
//!    ▲                               └─── set_ready, pending ───┤
//!    └────────────────────── set_ready ─────────────────────────┘
//! ```

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use kiln_core::Flag;
use thiserror::Error;

use crate::frame::{CommandStream, GraphContext, PassInfo, RenderInfo};
use crate::gpu::{Gpu, GpuError};
use crate::pass::{Pass, PassError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsyncError {
    #[error("async group '{label}' has no attached work")]
    NotAttached { label: String },
    #[error("async group '{label}' ran before the graph was set up")]
    NotSetUp { label: String },
    #[error(transparent)]
    Pass(#[from] PassError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error("prepare hook failed: {0}")]
    Prepare(String),
    #[error("failed to spawn async worker: {0}")]
    Spawn(String),
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Values handed to `run`. Calls that arrive while busy are merged.
pub trait AsyncParameters: Clone + Send + 'static {
    /// Fold `newer` into `self`; `newer` wins on conflicts.
    fn merge(&mut self, newer: Self);
}

impl AsyncParameters for () {
    fn merge(&mut self, _newer: Self) {}
}

impl<K, V> AsyncParameters for HashMap<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn merge(&mut self, newer: Self) {
        self.extend(newer);
    }
}

impl<K, V> AsyncParameters for BTreeMap<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn merge(&mut self, newer: Self) {
        self.extend(newer);
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncState<P> {
    Idle,
    Dispatching { running: P, pending: Option<P> },
    /// The last result is ready and the frame side has not seen it yet.
    Complete { finished: P, pending: Option<P> },
    /// The frame side has seen the result and owes a `set_ready`.
    AwaitingConsumption { finished: P, pending: Option<P> },
}

/// What the coordinator must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action<P> {
    None,
    Dispatch(P),
    Complete(P),
}

fn merge_pending<P: AsyncParameters>(pending: &mut Option<P>, params: P) {
    match pending {
        Some(existing) => existing.merge(params),
        None => *pending = Some(params),
    }
}

impl<P: AsyncParameters> AsyncState<P> {
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    pub fn is_dispatching(&self) -> bool {
        matches!(self, Self::Dispatching { .. })
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::AwaitingConsumption { .. }
        )
    }

    pub fn on_run(&mut self, params: P) -> Action<P> {
        match self {
            Self::Idle => {
                *self = Self::Dispatching {
                    running: params.clone(),
                    pending: None,
                };
                Action::Dispatch(params)
            }
            Self::Dispatching { pending, .. }
            | Self::Complete { pending, .. }
            | Self::AwaitingConsumption { pending, .. } => {
                merge_pending(pending, params);
                Action::None
            }
        }
    }

    pub fn on_dispatch_finished(&mut self, ok: bool) -> Action<P> {
        match mem::replace(self, Self::Idle) {
            Self::Dispatching {
                pending: Some(next),
                ..
            } => {
                *self = Self::Dispatching {
                    running: next.clone(),
                    pending: None,
                };
                Action::Dispatch(next)
            }
            Self::Dispatching { running, pending: None } if ok => {
                *self = Self::Complete {
                    finished: running.clone(),
                    pending: None,
                };
                Action::Complete(running)
            }
            Self::Dispatching { pending: None, .. } => Action::None,
            other => {
                *self = other;
                Action::None
            }
        }
    }

    /// Returns whether the state changed.
    pub fn on_frame_observed(&mut self) -> bool {
        match mem::replace(self, Self::Idle) {
            Self::Complete { finished, pending } => {
                *self = Self::AwaitingConsumption { finished, pending };
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }

    pub fn on_set_ready(&mut self) -> Action<P> {
        match mem::replace(self, Self::Idle) {
            Self::Complete { pending, .. } | Self::AwaitingConsumption { pending, .. } => {
                match pending {
                    Some(next) => {
                        *self = Self::Dispatching {
                            running: next.clone(),
                            pending: None,
                        };
                        Action::Dispatch(next)
                    }
                    None => Action::None,
                }
            }
            other => {
                *self = other;
                Action::None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Work
// ---------------------------------------------------------------------------

/// The subtree an async group runs, with the graph state it needs.
pub struct AsyncWork<G: Gpu> {
    label: String,
    context: Arc<GraphContext<G>>,
    passes: Vec<Box<dyn Pass<G>>>,
    runs: u64,
}

impl<G: Gpu> AsyncWork<G> {
    pub(crate) fn new(
        label: impl Into<String>,
        context: Arc<GraphContext<G>>,
        passes: Vec<Box<dyn Pass<G>>>,
    ) -> Self {
        Self {
            label: label.into(),
            context,
            passes,
            runs: 0,
        }
    }

    /// Encode the subtree, submit it and wait for the GPU.
    pub fn run(&mut self) -> Result<(), AsyncError> {
        let context = Arc::clone(&self.context);
        let resources = context.resources();
        let surface = resources.surface().ok_or_else(|| AsyncError::NotSetUp {
            label: self.label.clone(),
        })?;

        let info = RenderInfo {
            context: &context,
            resources: &*resources,
            surface,
        };
        for pass in &mut self.passes {
            pass.pre_run(&info)?;
        }

        let mut stream = CommandStream::new(Arc::clone(&context.gpu), format!("{} (async)", self.label));
        {
            let mut info = PassInfo {
                gpu: &*context.gpu,
                resources: &*resources,
                stream: &mut stream,
                surface: None,
                surface_info: surface,
                frame: self.runs,
            };
            for pass in &mut self.passes {
                pass.encode(&mut info)?;
            }
        }
        drop(resources);
        stream.commit_and_wait()?;
        self.runs += 1;
        Ok(())
    }
}

/// How the pass graph talks to an async coordinator.
pub trait AsyncLink<G: Gpu>: Send + Sync {
    fn label(&self) -> &str;
    /// Hand over the set-up subtree.
    fn attach(&self, work: AsyncWork<G>);
    /// Called once per frame by the graph.
    fn observe_frame(&self);
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

type CompleteFn<P> = Box<dyn FnMut(&P) + Send>;
type PrepareFn<P> = Box<dyn FnMut(&P) -> Result<(), String> + Send>;

struct Inner<P> {
    state: AsyncState<P>,
    /// The worker is inside a dispatch or its completion callback.
    executing: bool,
}

struct Shared<G: Gpu, P> {
    label: String,
    inner: Mutex<Inner<P>>,
    settled: Condvar,
    busy: Flag,
    complete: Flag,
    completed_once: Flag,
    dispatches: AtomicU64,
    on_complete: Mutex<Option<CompleteFn<P>>>,
    prepare: Mutex<Option<PrepareFn<P>>>,
    work: Mutex<Option<AsyncWork<G>>>,
    jobs: Sender<P>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<G: Gpu, P: AsyncParameters> Shared<G, P> {
    fn mirror(&self, state: &AsyncState<P>) {
        self.busy.set(state.is_busy());
        self.complete.set(state.is_complete());
    }

    /// Apply a transition and carry out its action outside the lock.
    fn transition(&self, f: impl FnOnce(&mut AsyncState<P>) -> Action<P>) {
        let action = {
            let mut inner = lock(&self.inner);
            let action = f(&mut inner.state);
            self.mirror(&inner.state);
            action
        };
        self.act(action);
        self.settled.notify_all();
    }

    fn act(&self, action: Action<P>) {
        match action {
            Action::None => {}
            Action::Dispatch(params) => {
                if self.jobs.send(params).is_err() {
                    tracing::error!("async group '{}': worker is gone", self.label);
                }
            }
            Action::Complete(params) => {
                self.completed_once.set(true);
                tracing::debug!("async group '{}' complete", self.label);
                // Called unlocked so the callback may register a successor.
                let taken = lock(&self.on_complete).take();
                if let Some(mut callback) = taken {
                    callback(&params);
                    let mut slot = lock(&self.on_complete);
                    if slot.is_none() {
                        *slot = Some(callback);
                    }
                }
            }
        }
    }

    fn dispatch(&self, params: &P) -> Result<(), AsyncError> {
        if let Some(prepare) = lock(&self.prepare).as_mut() {
            prepare(params).map_err(AsyncError::Prepare)?;
        }
        let mut work = lock(&self.work);
        let work = work.as_mut().ok_or_else(|| AsyncError::NotAttached {
            label: self.label.clone(),
        })?;
        work.run()
    }

    fn execute(&self, params: P, slot: &(Sender<()>, Receiver<()>)) {
        lock(&self.inner).executing = true;

        // One submission in flight at a time.
        if slot.1.recv().is_err() {
            return;
        }
        let started = Instant::now();
        self.dispatches.fetch_add(1, Ordering::AcqRel);
        let result = self.dispatch(&params);
        let _ = slot.0.send(());

        match &result {
            Ok(()) => tracing::trace!(
                "async group '{}' dispatched in {:.2?}",
                self.label,
                started.elapsed()
            ),
            Err(e) => tracing::error!("async group '{}' dispatch failed: {e}", self.label),
        }

        self.transition(|state| state.on_dispatch_finished(result.is_ok()));
        lock(&self.inner).executing = false;
        self.settled.notify_all();
    }
}

fn worker<G: Gpu, P: AsyncParameters>(shared: Weak<Shared<G, P>>, jobs: Receiver<P>) {
    let slot = crossbeam_channel::bounded(1);
    let _ = slot.0.send(());
    while let Ok(params) = jobs.recv() {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.execute(params, &slot);
    }
    tracing::debug!("async worker exiting");
}

/// Handle to an async coordinator. Clones share the same coordinator; the
/// worker exits when the last clone is dropped.
pub struct AsyncGroupHandle<G: Gpu, P: AsyncParameters = ()> {
    shared: Arc<Shared<G, P>>,
}

impl<G: Gpu, P: AsyncParameters> Clone for AsyncGroupHandle<G, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<G: Gpu, P: AsyncParameters> AsyncGroupHandle<G, P> {
    pub fn new(label: impl Into<String>) -> Result<Self, AsyncError> {
        let label = label.into();
        let (jobs, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            label: label.clone(),
            inner: Mutex::new(Inner {
                state: AsyncState::Idle,
                executing: false,
            }),
            settled: Condvar::new(),
            busy: Flag::default(),
            complete: Flag::default(),
            completed_once: Flag::default(),
            dispatches: AtomicU64::new(0),
            on_complete: Mutex::new(None),
            prepare: Mutex::new(None),
            work: Mutex::new(None),
            jobs,
        });
        let weak = Arc::downgrade(&shared);
        thread::Builder::new()
            .name(format!("kiln-async-{label}"))
            .spawn(move || worker(weak, receiver))
            .map_err(|e| AsyncError::Spawn(e.to_string()))?;
        Ok(Self { shared })
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Called on the worker with the parameters of each finished run.
    pub fn on_complete(&self, callback: impl FnMut(&P) + Send + 'static) {
        *lock(&self.shared.on_complete) = Some(Box::new(callback));
    }

    /// Called on the worker before each dispatch is encoded.
    pub fn on_prepare(&self, hook: impl FnMut(&P) -> Result<(), String> + Send + 'static) {
        *lock(&self.shared.prepare) = Some(Box::new(hook));
    }

    /// Dispatch now if idle, otherwise merge into the pending parameters.
    pub fn run(&self, params: P) {
        self.shared.transition(|state| {
            let action = state.on_run(params);
            if matches!(action, Action::None) {
                tracing::trace!("async group '{}' busy, parameters coalesced", self.shared.label);
            }
            action
        });
    }

    /// Acknowledge the last result. Parameters that arrived after it
    /// completed are dispatched right away.
    pub fn set_ready(&self) {
        self.shared.transition(AsyncState::on_set_ready);
    }

    pub fn state(&self) -> AsyncState<P> {
        lock(&self.shared.inner).state.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.get()
    }

    pub fn is_complete(&self) -> bool {
        self.shared.complete.get()
    }

    pub fn was_completed(&self) -> bool {
        self.shared.completed_once.get()
    }

    /// Mirrors `is_busy`, for binding to a group's activation.
    pub fn busy_flag(&self) -> Flag {
        self.shared.busy.clone()
    }

    pub fn complete_flag(&self) -> Flag {
        self.shared.complete.clone()
    }

    pub fn completed_once_flag(&self) -> Flag {
        self.shared.completed_once.clone()
    }

    /// Dispatches started so far, failed ones included.
    pub fn dispatch_count(&self) -> u64 {
        self.shared.dispatches.load(Ordering::Acquire)
    }

    /// Block until no dispatch is in flight or queued. Returns `false` on
    /// timeout.
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.shared.inner);
        while inner.executing || inner.state.is_dispatching() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self
                .shared
                .settled
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn link(&self) -> Arc<dyn AsyncLink<G>> {
        Arc::new(self.clone())
    }
}

impl<G: Gpu, P: AsyncParameters> AsyncLink<G> for AsyncGroupHandle<G, P> {
    fn label(&self) -> &str {
        &self.shared.label
    }

    fn attach(&self, work: AsyncWork<G>) {
        tracing::info!("async group '{}' attached", self.shared.label);
        *lock(&self.shared.work) = Some(work);
    }

    fn observe_frame(&self) {
        let mut inner = lock(&self.shared.inner);
        if inner.state.on_frame_observed() {
            self.shared.mirror(&inner.state);
        }
    }
}

/// Graph node of an async group: sets the subtree up, hands it to the
/// coordinator and afterwards only reports frames.
pub struct AsyncGroupPass<G: Gpu> {
    label: String,
    link: Arc<dyn AsyncLink<G>>,
    children: Option<Vec<Box<dyn Pass<G>>>>,
}

impl<G: Gpu> AsyncGroupPass<G> {
    pub fn new(label: impl Into<String>, link: Arc<dyn AsyncLink<G>>, children: Vec<Box<dyn Pass<G>>>) -> Self {
        Self {
            label: label.into(),
            link,
            children: Some(children),
        }
    }
}

impl<G: Gpu> Pass<G> for AsyncGroupPass<G> {
    fn label(&self) -> &str {
        &self.label
    }

    fn setup(&mut self, info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        let Some(mut children) = self.children.take() else {
            return Ok(());
        };
        for child in &mut children {
            child.setup(info)?;
        }
        self.link
            .attach(AsyncWork::new(&self.label, Arc::clone(info.context), children));
        Ok(())
    }

    fn encode(&mut self, _info: &mut PassInfo<'_, G>) -> Result<(), PassError> {
        self.link.observe_frame();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompileOptions};
    use crate::component::Program;
    use crate::frame::SurfaceInfo;
    use crate::recording::RecordingGpu;
    use crate::resources::ResourcePool;
    use kiln_core::{PixelFormat, ResourceTable};

    type Params = BTreeMap<String, f32>;

    fn params(pairs: &[(&str, f32)]) -> Params {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn empty_work(label: &str) -> AsyncWork<RecordingGpu> {
        let gpu = Arc::new(RecordingGpu::default());
        let table = ResourceTable::new();
        let compiled = compile(&Program::<RecordingGpu>::new(""), &table, &CompileOptions::default()).unwrap();
        let pool = ResourcePool::new(table, compiled.resources.clone());
        let context = Arc::new(GraphContext::new(Arc::clone(&gpu), compiled, pool));
        context
            .resources_mut()
            .materialize(&gpu, SurfaceInfo::new(64, 64, PixelFormat::Bgra8UnormSrgb))
            .unwrap();
        AsyncWork::new(label, context, Vec::new())
    }

    #[test]
    fn test_state_coalesces_while_dispatching() {
        let mut state = AsyncState::Idle;
        assert_eq!(state.on_run(params(&[("a", 1.0)])), Action::Dispatch(params(&[("a", 1.0)])));
        assert_eq!(state.on_run(params(&[("b", 2.0), ("x", 1.0)])), Action::None);
        assert_eq!(state.on_run(params(&[("c", 3.0), ("x", 2.0)])), Action::None);

        let merged = params(&[("b", 2.0), ("c", 3.0), ("x", 2.0)]);
        assert_eq!(state.on_dispatch_finished(true), Action::Dispatch(merged.clone()));
        assert_eq!(state.on_dispatch_finished(true), Action::Complete(merged.clone()));
        assert!(state.is_complete());
        assert!(state.is_busy());

        assert!(state.on_frame_observed());
        assert!(!state.on_frame_observed());
        assert!(matches!(state, AsyncState::AwaitingConsumption { .. }));
        assert_eq!(state.on_set_ready(), Action::None);
        assert_eq!(state, AsyncState::Idle);
    }

    #[test]
    fn test_state_failure_returns_to_idle() {
        let mut state = AsyncState::Idle;
        state.on_run(());
        assert_eq!(state.on_dispatch_finished(false), Action::None);
        assert_eq!(state, AsyncState::Idle);

        // A failure with pending parameters still redispatches.
        state.on_run(());
        state.on_run(());
        assert_eq!(state.on_dispatch_finished(false), Action::Dispatch(()));
    }

    #[test]
    fn test_state_run_after_complete_waits_for_ready() {
        let mut state = AsyncState::Idle;
        state.on_run(params(&[("a", 1.0)]));
        state.on_dispatch_finished(true);
        assert_eq!(state.on_run(params(&[("b", 2.0)])), Action::None);
        assert_eq!(state.on_set_ready(), Action::Dispatch(params(&[("b", 2.0)])));
        assert!(state.is_dispatching());
    }

    #[test]
    fn test_state_ignores_out_of_order_events() {
        let mut state: AsyncState<()> = AsyncState::Idle;
        assert_eq!(state.on_dispatch_finished(true), Action::None);
        assert_eq!(state.on_set_ready(), Action::None);
        assert!(!state.on_frame_observed());
        assert_eq!(state, AsyncState::Idle);
    }

    #[test]
    fn test_map_merge_newer_wins() {
        let mut older: HashMap<&str, i32> = [("a", 1), ("b", 1)].into_iter().collect();
        older.merge([("b", 2), ("c", 3)].into_iter().collect());
        assert_eq!(older.len(), 3);
        assert_eq!(older["b"], 2);
    }

    #[test]
    fn test_runs_while_busy_coalesce_into_one_dispatch() {
        let handle: AsyncGroupHandle<RecordingGpu, Params> = AsyncGroupHandle::new("sim").unwrap();
        handle.link().attach(empty_work("sim"));

        let (gate_tx, gate_rx) = crossbeam_channel::unbounded::<()>();
        let prepared = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&prepared);
        handle.on_prepare(move |p| {
            seen.lock().unwrap().push(p.clone());
            gate_rx.recv().map_err(|e| e.to_string())
        });
        let completed = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::clone(&completed);
        handle.on_complete(move |p| done.lock().unwrap().push(p.clone()));

        handle.run(params(&[("a", 1.0)]));
        handle.run(params(&[("b", 2.0), ("x", 1.0)]));
        handle.run(params(&[("c", 3.0), ("x", 2.0)]));
        assert!(handle.is_busy());
        assert!(!handle.is_complete());

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        assert!(handle.wait_settled(Duration::from_secs(10)));

        let merged = params(&[("b", 2.0), ("c", 3.0), ("x", 2.0)]);
        assert_eq!(handle.dispatch_count(), 2);
        assert_eq!(*prepared.lock().unwrap(), vec![params(&[("a", 1.0)]), merged.clone()]);
        assert_eq!(*completed.lock().unwrap(), vec![merged]);
        assert!(handle.is_complete());
        assert!(handle.was_completed());

        handle.link().observe_frame();
        assert!(handle.is_complete());
        handle.set_ready();
        assert!(!handle.is_busy());
        assert!(!handle.is_complete());
        assert!(handle.was_completed());
    }

    #[test]
    fn test_failed_dispatch_skips_callback() {
        let handle: AsyncGroupHandle<RecordingGpu> = AsyncGroupHandle::new("detached").unwrap();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        handle.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.run(());
        assert!(handle.wait_settled(Duration::from_secs(10)));
        assert_eq!(handle.dispatch_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state(), AsyncState::Idle);
        assert!(!handle.is_busy());
        assert!(!handle.was_completed());
    }

    #[test]
    fn test_run_after_complete_dispatches_on_ready() {
        let handle: AsyncGroupHandle<RecordingGpu, Params> = AsyncGroupHandle::new("bake").unwrap();
        handle.link().attach(empty_work("bake"));
        let completed = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::clone(&completed);
        handle.on_complete(move |p| done.lock().unwrap().push(p.clone()));

        handle.run(params(&[("a", 1.0)]));
        assert!(handle.wait_settled(Duration::from_secs(10)));
        handle.run(params(&[("b", 2.0)]));
        assert!(handle.wait_settled(Duration::from_secs(10)));
        assert_eq!(handle.dispatch_count(), 1);

        handle.set_ready();
        assert!(handle.wait_settled(Duration::from_secs(10)));
        assert_eq!(handle.dispatch_count(), 2);
        assert_eq!(
            *completed.lock().unwrap(),
            vec![params(&[("a", 1.0)]), params(&[("b", 2.0)])]
        );
    }

    #[test]
    fn test_completion_callback_can_replace_itself() {
        let handle: AsyncGroupHandle<RecordingGpu, Params> = AsyncGroupHandle::new("chain").unwrap();
        handle.link().attach(empty_work("chain"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner = handle.clone();
        let first = Arc::clone(&seen);
        handle.on_complete(move |p| {
            first.lock().unwrap().push(("first", p.clone()));
            let second = Arc::clone(&first);
            inner.on_complete(move |p| second.lock().unwrap().push(("second", p.clone())));
        });

        handle.run(params(&[("a", 1.0)]));
        assert!(handle.wait_settled(Duration::from_secs(10)));
        handle.set_ready();
        handle.run(params(&[("b", 2.0)]));
        assert!(handle.wait_settled(Duration::from_secs(10)));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", params(&[("a", 1.0)])), ("second", params(&[("b", 2.0)]))]
        );
    }
}
