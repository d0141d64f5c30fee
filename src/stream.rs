//! The fluent pipeline builder and the stream runtime.
//!
//! A [`StreamBuilder`] composes a typed chain of operators; `In` is the type
//! entering the head and `Cur` the type leaving the current tail. Appending
//! an operator stacks a linking step, and the terminal call (`sink`, `build`,
//! fork branches) threads the chain together into the erased head the
//! runtime owns. Invalid topologies (double source, duplicate branch names)
//! panic at configuration time; runtime misuse surfaces as
//! [`StreamError::IllegalConfiguration`].

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::StreamError;
use crate::operator::window::{
    GlobalTumblingWindow, GlobalWindowCheckpoint, GlobalWindowKey, SessionState, SessionWindow,
    SlidingState, SlidingWindow, TimeMode, TumblingWindow, WindowCombine, WindowKey, WindowKeyer,
    WindowState,
};
use crate::operator::{
    AggregateByKey, AggregateSilently, BoxedOperator, Data, DataKey, Discard, Emitter, Filter,
    FlatMap, ForEachSink, Fork, GroupByKey, GroupBySilently, Join, KeyerFn, Map, Operator,
    SourceOperator,
};
use crate::store::{InMemoryStore, SharedStore, StoreDescriptor};
use crate::telemetry::TelemetryRef;

type Link<In, Cur> = Box<dyn FnOnce(BoxedOperator<Cur>) -> BoxedOperator<In> + Send>;

/// Entry point: `StreamBuilder::create("orders")`.
pub struct StreamBuilder<In: Data, Cur: Data = In> {
    name: String,
    source: Option<Box<dyn SourceOperator<In>>>,
    link: Link<In, Cur>,
    telemetry: Option<TelemetryRef>,
    clock: Arc<dyn Clock>,
}

impl<In: Data> StreamBuilder<In, In> {
    pub fn create(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            link: Box::new(|tail| tail),
            telemetry: None,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Alias for [`StreamBuilder::create`].
pub fn create_stream<In: Data>(name: impl Into<String>) -> StreamBuilder<In, In> {
    StreamBuilder::create(name)
}

impl<In: Data, Cur: Data> StreamBuilder<In, Cur> {
    /// Attach the source feeding the pipeline. Without one, values enter
    /// through [`Stream::emit`].
    pub fn source(mut self, source: impl SourceOperator<In> + 'static) -> Self {
        if self.source.is_some() {
            panic!("stream {} already has a source", self.name);
        }
        self.source = Some(Box::new(source));
        self
    }

    /// Telemetry provider wired through the whole chain on `start`.
    pub fn with_telemetry(mut self, provider: TelemetryRef) -> Self {
        self.telemetry = Some(provider);
        self
    }

    /// Clock used by the windowed operators added after this call.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn append<NewCur, Op, Set>(self, mut op: Op, set_next: Set) -> StreamBuilder<In, NewCur>
    where
        NewCur: Data,
        Op: Operator<In = Cur> + 'static,
        Set: FnOnce(&mut Op, BoxedOperator<NewCur>) -> Result<(), StreamError> + Send + 'static,
    {
        let link = self.link;
        StreamBuilder {
            name: self.name,
            source: self.source,
            link: Box::new(move |tail| {
                set_next(&mut op, tail).expect("a freshly built operator accepts a downstream");
                link(Box::new(op))
            }),
            telemetry: self.telemetry,
            clock: self.clock,
        }
    }

    pub fn filter(self, predicate: impl FnMut(&Cur) -> bool + Send + 'static) -> Self {
        self.append(Filter::new(predicate), Filter::set_next)
    }

    pub fn map<NewCur: Data>(
        self,
        f: impl FnMut(Cur) -> NewCur + Send + 'static,
    ) -> StreamBuilder<In, NewCur> {
        self.append(Map::new(f), Map::set_next)
    }

    pub fn flat_map<NewCur: Data>(
        self,
        f: impl FnMut(Cur) -> Vec<NewCur> + Send + 'static,
    ) -> StreamBuilder<In, NewCur> {
        self.append(FlatMap::new(f), FlatMap::set_next)
    }

    pub fn group_by<Key: DataKey>(
        self,
        keyer: impl KeyerFn<Key, Cur>,
    ) -> StreamBuilder<In, (Key, Vec<Cur>)> {
        let store = Arc::new(InMemoryStore::new(format!("{}-group-by", self.name)));
        self.group_by_in(keyer, store)
    }

    pub fn group_by_in<Key: DataKey>(
        self,
        keyer: impl KeyerFn<Key, Cur>,
        store: SharedStore<Key, Vec<Cur>>,
    ) -> StreamBuilder<In, (Key, Vec<Cur>)> {
        self.append(GroupByKey::new(keyer, store), GroupByKey::set_next)
    }

    pub fn group_by_silently<Key: DataKey>(self, keyer: impl KeyerFn<Key, Cur>) -> Self {
        let store = Arc::new(InMemoryStore::new(format!("{}-group-by", self.name)));
        self.group_by_silently_in(keyer, store)
    }

    pub fn group_by_silently_in<Key: DataKey>(
        self,
        keyer: impl KeyerFn<Key, Cur>,
        store: SharedStore<Key, Vec<Cur>>,
    ) -> Self {
        self.append(GroupBySilently::new(keyer, store), GroupBySilently::set_next)
    }

    pub fn aggregate<Key: DataKey, Acc: Data + Default>(
        self,
        keyer: impl KeyerFn<Key, Cur>,
        agg: impl Fn(Acc, &Cur) -> Acc + Send + 'static,
    ) -> StreamBuilder<In, (Key, Acc)> {
        let store = Arc::new(InMemoryStore::new(format!("{}-aggregate", self.name)));
        self.aggregate_in(keyer, agg, store)
    }

    pub fn aggregate_in<Key: DataKey, Acc: Data + Default>(
        self,
        keyer: impl KeyerFn<Key, Cur>,
        agg: impl Fn(Acc, &Cur) -> Acc + Send + 'static,
        store: SharedStore<Key, Acc>,
    ) -> StreamBuilder<In, (Key, Acc)> {
        self.append(AggregateByKey::new(keyer, agg, store), AggregateByKey::set_next)
    }

    pub fn aggregate_silently<Key: DataKey, Acc: Data + Default>(
        self,
        keyer: impl KeyerFn<Key, Cur>,
        agg: impl Fn(Acc, &Cur) -> Acc + Send + 'static,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new(format!("{}-aggregate", self.name)));
        self.aggregate_silently_in(keyer, agg, store)
    }

    pub fn aggregate_silently_in<Key: DataKey, Acc: Data + Default>(
        self,
        keyer: impl KeyerFn<Key, Cur>,
        agg: impl Fn(Acc, &Cur) -> Acc + Send + 'static,
        store: SharedStore<Key, Acc>,
    ) -> Self {
        self.append(
            AggregateSilently::new(keyer, agg, store),
            AggregateSilently::set_next,
        )
    }

    pub fn tumbling_window<Key: DataKey, Out: Data>(
        self,
        keyer: impl WindowKeyer<Key, Cur>,
        duration: Duration,
        combine: impl WindowCombine<Cur, Out>,
    ) -> StreamBuilder<In, (WindowKey<Key>, Out)> {
        let store = Arc::new(InMemoryStore::new(format!("{}-tumbling-window", self.name)));
        self.tumbling_window_in(keyer, duration, combine, store, None)
    }

    pub fn tumbling_window_in<Key: DataKey, Out: Data>(
        self,
        keyer: impl WindowKeyer<Key, Cur>,
        duration: Duration,
        combine: impl WindowCombine<Cur, Out>,
        window_store: SharedStore<Key, WindowState<Cur>>,
        results_store: Option<SharedStore<WindowKey<Key>, Out>>,
    ) -> StreamBuilder<In, (WindowKey<Key>, Out)> {
        let window = TumblingWindow::new(
            format!("{}-tumbling", self.name),
            keyer,
            duration,
            combine,
            self.clock.clone(),
            window_store,
            results_store,
        );
        self.append(window, TumblingWindow::set_next)
    }

    pub fn tumbling_window_all<Out: Data>(
        self,
        duration: Duration,
        mode: TimeMode<Cur>,
        combine: impl WindowCombine<Cur, Out>,
    ) -> StreamBuilder<In, (GlobalWindowKey, Out)> {
        self.tumbling_window_all_in(duration, mode, combine, None, None)
    }

    pub fn tumbling_window_all_in<Out: Data>(
        self,
        duration: Duration,
        mode: TimeMode<Cur>,
        combine: impl WindowCombine<Cur, Out>,
        checkpoint_store: Option<SharedStore<String, GlobalWindowCheckpoint>>,
        audit_store: Option<SharedStore<GlobalWindowKey, Out>>,
    ) -> StreamBuilder<In, (GlobalWindowKey, Out)> {
        let window = GlobalTumblingWindow::new(
            format!("{}-tumbling-all", self.name),
            duration,
            mode,
            combine,
            self.clock.clone(),
            checkpoint_store,
            audit_store,
        );
        self.append(window, GlobalTumblingWindow::set_next)
    }

    pub fn sliding_window<Key: DataKey, Out: Data>(
        self,
        keyer: impl WindowKeyer<Key, Cur>,
        duration: Duration,
        slide: Duration,
        combine: impl WindowCombine<Cur, Out>,
    ) -> StreamBuilder<In, (WindowKey<Key>, Out)> {
        let store = Arc::new(InMemoryStore::new(format!("{}-sliding-window", self.name)));
        self.sliding_window_in(keyer, duration, slide, combine, store, None)
    }

    pub fn sliding_window_in<Key: DataKey, Out: Data>(
        self,
        keyer: impl WindowKeyer<Key, Cur>,
        duration: Duration,
        slide: Duration,
        combine: impl WindowCombine<Cur, Out>,
        window_store: SharedStore<Key, SlidingState<Cur>>,
        results_store: Option<SharedStore<WindowKey<Key>, Out>>,
    ) -> StreamBuilder<In, (WindowKey<Key>, Out)> {
        let window = SlidingWindow::new(
            format!("{}-sliding", self.name),
            keyer,
            duration,
            slide,
            combine,
            self.clock.clone(),
            window_store,
            results_store,
        );
        self.append(window, SlidingWindow::set_next)
    }

    pub fn session_window<Key: DataKey, Out: Data>(
        self,
        keyer: impl WindowKeyer<Key, Cur>,
        inactivity_gap: Duration,
        combine: impl WindowCombine<Cur, Out>,
    ) -> StreamBuilder<In, (WindowKey<Key>, Out)> {
        let store = Arc::new(InMemoryStore::new(format!("{}-session-window", self.name)));
        self.session_window_in(keyer, inactivity_gap, combine, store, None)
    }

    pub fn session_window_in<Key: DataKey, Out: Data>(
        self,
        keyer: impl WindowKeyer<Key, Cur>,
        inactivity_gap: Duration,
        combine: impl WindowCombine<Cur, Out>,
        session_store: SharedStore<Key, SessionState<Cur>>,
        results_store: Option<SharedStore<WindowKey<Key>, Out>>,
    ) -> StreamBuilder<In, (WindowKey<Key>, Out)> {
        let window = SessionWindow::new(
            format!("{}-session", self.name),
            keyer,
            inactivity_gap,
            combine,
            self.clock.clone(),
            session_store,
            results_store,
        );
        self.append(window, SessionWindow::set_next)
    }

    /// Stream-table join against an externally populated store.
    pub fn join<Key: DataKey, Right: Data, Out: Data>(
        self,
        store: SharedStore<Key, Right>,
        keyer: impl KeyerFn<Key, Cur>,
        join_fn: impl FnMut(Cur, Right) -> Out + Send + 'static,
    ) -> StreamBuilder<In, Out> {
        self.append(Join::new(store, keyer, join_fn), Join::set_next)
    }

    /// Terminate the chain in a fork and open the first named branch.
    pub fn add_branch(
        self,
        name: impl Into<String>,
        build: impl FnOnce(BranchBuilder<Cur, Cur>) -> ClosedBranch<Cur>,
    ) -> ForkedStreamBuilder<In, Cur> {
        let forked = ForkedStreamBuilder {
            name: self.name,
            source: self.source,
            link: self.link,
            fork: Fork::new(),
            telemetry: self.telemetry,
            clock: self.clock,
        };
        forked.add_branch(name, build)
    }

    /// Terminate the chain with a closure sink.
    pub fn sink(self, f: impl FnMut(Cur) + Send + 'static) -> ClosedStreamBuilder<In> {
        self.sink_op(ForEachSink::new(f))
    }

    /// Terminate the chain with a prebuilt sink operator.
    pub fn sink_op(self, sink: impl Operator<In = Cur> + 'static) -> ClosedStreamBuilder<In> {
        ClosedStreamBuilder {
            name: self.name,
            source: self.source,
            head: (self.link)(Box::new(sink)),
            branches: Vec::new(),
            telemetry: self.telemetry,
        }
    }

    /// Build without an explicit sink; the tail discards what reaches it.
    pub fn build(self) -> Stream<In> {
        self.sink_op(Discard::new()).build()
    }
}

/// A builder whose chain ends in a fork; only more branches can be added.
pub struct ForkedStreamBuilder<In: Data, Cur: Data> {
    name: String,
    source: Option<Box<dyn SourceOperator<In>>>,
    link: Link<In, Cur>,
    fork: Fork<Cur>,
    telemetry: Option<TelemetryRef>,
    clock: Arc<dyn Clock>,
}

impl<In: Data, Cur: Data> ForkedStreamBuilder<In, Cur> {
    pub fn add_branch(
        mut self,
        name: impl Into<String>,
        build: impl FnOnce(BranchBuilder<Cur, Cur>) -> ClosedBranch<Cur>,
    ) -> Self {
        let name = name.into();
        let branch = build(BranchBuilder::new(
            format!("{}-{}", self.name, name),
            self.clock.clone(),
        ));
        if let Err(e) = self.fork.add_branch(name, branch.head) {
            panic!("stream {}: {e}", self.name);
        }
        self
    }

    pub fn build(self) -> Stream<In> {
        let branches = self.fork.branch_names();
        ClosedStreamBuilder {
            name: self.name,
            source: self.source,
            head: (self.link)(Box::new(self.fork)),
            branches,
            telemetry: self.telemetry,
        }
        .build()
    }
}

/// A fully linked chain, ready to become a [`Stream`].
pub struct ClosedStreamBuilder<In: Data> {
    name: String,
    source: Option<Box<dyn SourceOperator<In>>>,
    head: BoxedOperator<In>,
    branches: Vec<String>,
    telemetry: Option<TelemetryRef>,
}

impl<In: Data> ClosedStreamBuilder<In> {
    pub fn build(self) -> Stream<In> {
        Stream {
            name: self.name,
            head: Arc::new(Mutex::new(self.head)),
            source: self.source,
            branches: self.branches,
            status: StreamStatus::Stopped,
            telemetry: self.telemetry,
        }
    }
}

/// Sub-pipeline builder used inside [`StreamBuilder::add_branch`]; it cannot
/// carry a source or fork again, and must end in a sink.
pub struct BranchBuilder<In: Data, Cur: Data = In> {
    inner: StreamBuilder<In, Cur>,
}

/// A finished branch: the head operator of its sub-chain.
pub struct ClosedBranch<In: Data> {
    head: BoxedOperator<In>,
}

impl<In: Data> BranchBuilder<In, In> {
    fn new(name: String, clock: Arc<dyn Clock>) -> Self {
        let mut inner = StreamBuilder::create(name);
        inner.clock = clock;
        Self { inner }
    }
}

impl<In: Data, Cur: Data> BranchBuilder<In, Cur> {
    fn wrap<NewCur: Data>(inner: StreamBuilder<In, NewCur>) -> BranchBuilder<In, NewCur> {
        BranchBuilder { inner }
    }

    pub fn filter(self, predicate: impl FnMut(&Cur) -> bool + Send + 'static) -> Self {
        Self::wrap(self.inner.filter(predicate))
    }

    pub fn map<NewCur: Data>(
        self,
        f: impl FnMut(Cur) -> NewCur + Send + 'static,
    ) -> BranchBuilder<In, NewCur> {
        BranchBuilder::<In, Cur>::wrap(self.inner.map(f))
    }

    pub fn flat_map<NewCur: Data>(
        self,
        f: impl FnMut(Cur) -> Vec<NewCur> + Send + 'static,
    ) -> BranchBuilder<In, NewCur> {
        BranchBuilder::<In, Cur>::wrap(self.inner.flat_map(f))
    }

    pub fn group_by<Key: DataKey>(
        self,
        keyer: impl KeyerFn<Key, Cur>,
    ) -> BranchBuilder<In, (Key, Vec<Cur>)> {
        BranchBuilder::<In, Cur>::wrap(self.inner.group_by(keyer))
    }

    pub fn group_by_in<Key: DataKey>(
        self,
        keyer: impl KeyerFn<Key, Cur>,
        store: SharedStore<Key, Vec<Cur>>,
    ) -> BranchBuilder<In, (Key, Vec<Cur>)> {
        BranchBuilder::<In, Cur>::wrap(self.inner.group_by_in(keyer, store))
    }

    pub fn aggregate<Key: DataKey, Acc: Data + Default>(
        self,
        keyer: impl KeyerFn<Key, Cur>,
        agg: impl Fn(Acc, &Cur) -> Acc + Send + 'static,
    ) -> BranchBuilder<In, (Key, Acc)> {
        BranchBuilder::<In, Cur>::wrap(self.inner.aggregate(keyer, agg))
    }

    pub fn aggregate_in<Key: DataKey, Acc: Data + Default>(
        self,
        keyer: impl KeyerFn<Key, Cur>,
        agg: impl Fn(Acc, &Cur) -> Acc + Send + 'static,
        store: SharedStore<Key, Acc>,
    ) -> BranchBuilder<In, (Key, Acc)> {
        BranchBuilder::<In, Cur>::wrap(self.inner.aggregate_in(keyer, agg, store))
    }

    pub fn join<Key: DataKey, Right: Data, Out: Data>(
        self,
        store: SharedStore<Key, Right>,
        keyer: impl KeyerFn<Key, Cur>,
        join_fn: impl FnMut(Cur, Right) -> Out + Send + 'static,
    ) -> BranchBuilder<In, Out> {
        BranchBuilder::<In, Cur>::wrap(self.inner.join(store, keyer, join_fn))
    }

    pub fn sink(self, f: impl FnMut(Cur) + Send + 'static) -> ClosedBranch<In> {
        self.sink_op(ForEachSink::new(f))
    }

    pub fn sink_op(self, sink: impl Operator<In = Cur> + 'static) -> ClosedBranch<In> {
        ClosedBranch {
            head: (self.inner.link)(Box::new(sink)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Running,
    Stopped,
}

impl Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamStatus::Running => write!(f, "Running"),
            StreamStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

/// A built pipeline. The runtime owns the operators from `build` to `stop`.
pub struct Stream<In: Data> {
    name: String,
    head: Arc<Mutex<BoxedOperator<In>>>,
    source: Option<Box<dyn SourceOperator<In>>>,
    branches: Vec<String>,
    status: StreamStatus,
    telemetry: Option<TelemetryRef>,
}

impl<In: Data> Stream<In> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Activate window timers and the source worker.
    pub fn start(&mut self) -> Result<(), StreamError> {
        if self.status == StreamStatus::Running {
            return Ok(());
        }
        {
            let mut head = self.head.lock();
            if let Some(provider) = &self.telemetry {
                head.set_telemetry_provider(provider);
            }
            head.start()?;
        }
        if let Some(source) = &mut self.source {
            source.start(Emitter::new(self.head.clone()))?;
        }
        self.status = StreamStatus::Running;
        tracing::info!("stream {} started", self.name);
        Ok(())
    }

    /// Stop the source, drain the timers and join every worker.
    pub fn stop(&mut self) -> Result<(), StreamError> {
        if self.status == StreamStatus::Stopped {
            return Ok(());
        }
        if let Some(source) = &mut self.source {
            source.stop()?;
        }
        self.head.lock().stop()?;
        self.status = StreamStatus::Stopped;
        tracing::info!("stream {} stopped", self.name);
        Ok(())
    }

    /// Push a value into the chain head. Only valid on a running stream
    /// built without a source.
    pub fn emit(&self, item: In) -> Result<(), StreamError> {
        if self.source.is_some() {
            return Err(StreamError::illegal(
                "emit is not available on a stream with a source",
            ));
        }
        if self.status != StreamStatus::Running {
            return Err(StreamError::illegal("the stream is not running"));
        }
        self.head.lock().process(item)
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn branches(&self) -> &[String] {
        &self.branches
    }

    /// Every state store reachable from the chain.
    pub fn state_stores(&self) -> Vec<StoreDescriptor> {
        self.head.lock().state_stores()
    }
}

impl<In: Data> Drop for Stream<In> {
    fn drop(&mut self) {
        if self.status == StreamStatus::Running {
            if let Err(e) = self.stop() {
                tracing::error!("stream {} failed to stop on drop: {e}", self.name);
            }
        }
    }
}
