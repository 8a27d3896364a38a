//! The deterministic replay core.
//!
//! Everything here is synchronous and transport-free: posts go in, states
//! come out. Determinism rests on three rules — official time is a pure
//! function of a post and the config, posts apply in (tick, remote index,
//! local insertion) order, and the transition functions never mutate their
//! inputs. The core holds states behind [`Arc`] and never clones them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

use tickline_codec::Value;

/// Default snapshot spacing in ticks.
pub const DEFAULT_SNAPSHOT_STRIDE: i64 = 8;

/// Default snapshot ring capacity.
pub const DEFAULT_SNAPSHOT_COUNT: usize = 256;

/// Extra margin subtracted from latest-index watermark advances, in ticks.
/// One tick keeps the watermark conservative against broker/client clock
/// granularity; tune with care, it trades prune latency for safety.
pub const LATEST_INDEX_MARGIN_TICKS: i64 = 1;

/// An input event, authoritative or locally predicted.
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    /// Broker-assigned index; `-1` while the post is a local prediction.
    pub index: i64,
    /// Broker-assigned timestamp, milliseconds (the poster's estimate for
    /// local predictions).
    pub server_time: i64,
    /// Poster's clock at send time, milliseconds.
    pub client_time: i64,
    /// Client-unique name matching a prediction to its echo.
    pub name: String,
    /// Decoded payload.
    pub data: Value,
}

/// Tick math and cache shape of a replay core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Simulation ticks per second.
    pub tick_rate: i64,
    /// Clock-skew tolerance, milliseconds.
    pub tolerance_ms: i64,
    /// Whether the snapshot ring is used at all.
    pub cache: bool,
    /// Ticks between consecutive snapshots.
    pub snapshot_stride: i64,
    /// Maximum snapshots retained.
    pub snapshot_count: usize,
}

impl CoreConfig {
    /// Config with the default cache shape.
    pub fn new(tick_rate: i64, tolerance_ms: i64) -> Self {
        assert!(tick_rate > 0, "tick_rate must be positive");
        Self {
            tick_rate,
            tolerance_ms,
            cache: true,
            snapshot_stride: DEFAULT_SNAPSHOT_STRIDE,
            snapshot_count: DEFAULT_SNAPSHOT_COUNT,
        }
    }
}

/// State transition applied once per tick.
pub type TickFn<S> = Box<dyn Fn(&S) -> S>;

/// State transition applied once per post within its tick.
pub type PostFn<S> = Box<dyn Fn(&Post, &S) -> S>;

#[derive(Default)]
struct TickBucket {
    /// Ascending by index.
    remote: Vec<Arc<Post>>,
    /// Insertion order.
    local: Vec<Arc<Post>>,
}

/// Snapshot of the core's bookkeeping for tests and debugging.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    /// Remote posts currently held (post-pruning).
    pub remote_posts: usize,
    /// Local predictions awaiting their echo.
    pub local_posts: usize,
    /// Highest remote index ever admitted.
    pub max_remote_index: i64,
    /// Largest `k` with all of `0..=k` seen.
    pub max_contiguous_remote_index: i64,
    /// Completeness watermark, milliseconds.
    pub no_pending_posts_before_ms: Option<i64>,
    /// First tick of the snapshot ring.
    pub snapshot_start_tick: Option<i64>,
    /// Ticks with a cached snapshot, ascending.
    pub snapshot_ticks: Vec<i64>,
    /// `(tick, remote indices, local names)` per non-empty bucket.
    pub timeline: Vec<(i64, Vec<i64>, Vec<String>)>,
    /// Times the snapshot ring was cleared or a prune was clamped.
    pub cache_drop_guard_hits: u64,
    /// Official tick of the index-0 post.
    pub initial_tick: Option<i64>,
}

/// The deterministic replay state machine.
pub struct ReplayCore<S> {
    config: CoreConfig,
    initial: Arc<S>,
    on_tick: TickFn<S>,
    on_post: PostFn<S>,

    remote_posts: HashMap<u64, Arc<Post>>,
    local_posts: HashMap<String, Arc<Post>>,
    timeline: BTreeMap<i64, TickBucket>,

    snapshots: BTreeMap<i64, Arc<S>>,
    snapshot_start_tick: Option<i64>,

    initial_time_value: Option<i64>,
    initial_tick_value: Option<i64>,
    max_remote_index: i64,
    max_contiguous_remote_index: i64,
    no_pending_posts_before_ms: Option<i64>,
    cache_drop_guard_hits: u64,
}

impl<S> ReplayCore<S> {
    /// Build a core around an initial state and its transition functions.
    pub fn new(config: CoreConfig, initial: S, on_tick: TickFn<S>, on_post: PostFn<S>) -> Self {
        Self {
            config,
            initial: Arc::new(initial),
            on_tick,
            on_post,
            remote_posts: HashMap::new(),
            local_posts: HashMap::new(),
            timeline: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            snapshot_start_tick: None,
            initial_time_value: None,
            initial_tick_value: None,
            max_remote_index: -1,
            max_contiguous_remote_index: -1,
            no_pending_posts_before_ms: None,
            cache_drop_guard_hits: 0,
        }
    }

    /// Official time: the poster's clock, clamped so it can lag the broker
    /// by at most the tolerance.
    pub fn official_time(&self, post: &Post) -> i64 {
        post.client_time.max(post.server_time - self.config.tolerance_ms)
    }

    /// Tick a post takes effect at.
    pub fn official_tick(&self, post: &Post) -> i64 {
        self.tick_of_time(self.official_time(post))
    }

    /// Tick containing a millisecond timestamp.
    pub fn tick_of_time(&self, time_ms: i64) -> i64 {
        (time_ms * self.config.tick_rate).div_euclid(1000)
    }

    /// Admit an authoritative post. Duplicates are ignored; a matching local
    /// prediction is rolled back first.
    pub fn admit_remote(&mut self, post: Post) {
        debug_assert!(post.index >= 0, "remote posts carry a broker index");

        // Echo rule: the prediction leaves the timeline before its
        // authoritative version enters, wherever either of them lands.
        if self.local_posts.contains_key(&post.name) {
            self.remove_local(&post.name);
        }

        if post.index == 0 && self.initial_time_value.is_none() {
            let time = self.official_time(&post);
            self.initial_time_value = Some(time);
            self.initial_tick_value = Some(self.tick_of_time(time));
        }

        // Anything at or below the contiguous frontier has been seen before,
        // even if pruning already dropped it; a reconnect replays the whole
        // backlog and must not disturb settled history.
        if post.index <= self.max_contiguous_remote_index
            || self.remote_posts.contains_key(&(post.index as u64))
        {
            trace!(index = post.index, "duplicate remote post ignored");
            return;
        }

        let tick = self.official_tick(&post);
        self.guard_pre_window(tick);

        let post = Arc::new(post);
        self.remote_posts.insert(post.index as u64, Arc::clone(&post));
        self.max_remote_index = self.max_remote_index.max(post.index);

        // Advance the contiguous frontier and the completeness watermark
        // through every gap this post just closed.
        loop {
            let candidate = (self.max_contiguous_remote_index + 1) as u64;
            let Some(time) = self.remote_posts.get(&candidate).map(|p| self.official_time(p))
            else {
                break;
            };
            self.max_contiguous_remote_index += 1;
            self.advance_watermark(time);
        }

        let bucket = self.timeline.entry(tick).or_default();
        let at = bucket.remote.partition_point(|p| p.index < post.index);
        bucket.remote.insert(at, post);

        self.invalidate_snapshots_from(tick);
    }

    /// Record a local prediction. A pending prediction with the same name is
    /// replaced.
    pub fn admit_local(&mut self, post: Post) {
        if self.local_posts.contains_key(&post.name) {
            self.remove_local(&post.name);
        }

        let tick = self.official_tick(&post);
        self.guard_pre_window(tick);

        let post = Arc::new(post);
        self.local_posts.insert(post.name.clone(), Arc::clone(&post));
        self.timeline.entry(tick).or_default().local.push(post);

        self.invalidate_snapshots_from(tick);
    }

    /// Drop a local prediction, by identity first and name scan second.
    pub fn remove_local(&mut self, name: &str) {
        let Some(post) = self.local_posts.remove(name) else {
            return;
        };
        let tick = self.official_tick(&post);
        if let Some(bucket) = self.timeline.get_mut(&tick) {
            if let Some(at) = bucket.local.iter().position(|p| Arc::ptr_eq(p, &post)) {
                bucket.local.remove(at);
            } else if let Some(at) = bucket.local.iter().position(|p| p.name == name) {
                bucket.local.remove(at);
            }
            if bucket.remote.is_empty() && bucket.local.is_empty() {
                self.timeline.remove(&tick);
            }
        }
        self.invalidate_snapshots_from(tick);
    }

    /// Feed a latest-index answer into the watermark.
    ///
    /// Only counts when we have already caught up through the reported
    /// index; the one-tick margin keeps the advance conservative.
    pub fn note_latest_index(&mut self, latest_index: i64, server_time: i64) {
        if latest_index > self.max_contiguous_remote_index {
            return;
        }
        let tick_ms = (1000 + self.config.tick_rate - 1) / self.config.tick_rate;
        let candidate = server_time - self.config.tolerance_ms - LATEST_INDEX_MARGIN_TICKS * tick_ms;
        self.advance_watermark(candidate);
    }

    fn advance_watermark(&mut self, candidate_ms: i64) {
        self.no_pending_posts_before_ms = Some(
            self.no_pending_posts_before_ms
                .map_or(candidate_ms, |w| w.max(candidate_ms)),
        );
    }

    /// Every tick below this is provably complete: the contiguous frontier
    /// and watermark guarantee no further post can land there.
    pub fn safe_prune_tick(&self) -> Option<i64> {
        self.no_pending_posts_before_ms
            .map(|ms| self.tick_of_time(ms))
    }

    fn cache_window_ticks(&self) -> i64 {
        self.config.snapshot_stride * (self.config.snapshot_count as i64 - 1).max(0)
    }

    /// Clamp a compute target so the snapshot window can never slide past
    /// provable history.
    pub fn safe_compute_tick(&self, requested: i64) -> i64 {
        match self.safe_prune_tick() {
            Some(safe) => requested.min(safe + self.cache_window_ticks()),
            None => requested,
        }
    }

    /// World state after applying everything through `at_tick`.
    pub fn compute_state_at(&mut self, at_tick: i64) -> Arc<S> {
        let at_tick = self.safe_compute_tick(at_tick);
        let Some(initial_tick) = self.initial_tick_value else {
            return Arc::clone(&self.initial);
        };
        if at_tick < initial_tick {
            return Arc::clone(&self.initial);
        }

        if !self.config.cache {
            let mut state = Arc::clone(&self.initial);
            for tick in initial_tick..=at_tick {
                state = self.apply_tick(&state, tick);
            }
            return state;
        }

        self.ensure_snapshots(at_tick);
        let (mut tick, mut state) = match self.snapshots.range(..=at_tick).next_back() {
            Some((&snap_tick, snap)) => (snap_tick + 1, Arc::clone(snap)),
            None => (initial_tick, Arc::clone(&self.initial)),
        };
        while tick <= at_tick {
            state = self.apply_tick(&state, tick);
            tick += 1;
        }
        state
    }

    /// `on_tick`, then the tick's remote posts by index, then its local
    /// posts in insertion order.
    fn apply_tick(&self, state: &Arc<S>, tick: i64) -> Arc<S> {
        let mut next = Arc::new((self.on_tick)(state));
        if let Some(bucket) = self.timeline.get(&tick) {
            for post in &bucket.remote {
                next = Arc::new((self.on_post)(post, &next));
            }
            for post in &bucket.local {
                next = Arc::new((self.on_post)(post, &next));
            }
        }
        next
    }

    /// Grow the snapshot ring until it covers `at_tick`, evicting from the
    /// old end (and pruning settled history) when it overflows.
    fn ensure_snapshots(&mut self, at_tick: i64) {
        let stride = self.config.snapshot_stride;
        let start = *self
            .snapshot_start_tick
            .get_or_insert(self.initial_tick_value.expect("caller saw index 0"));

        let mut next = match self.snapshots.keys().next_back() {
            Some(&last) => last + stride,
            None => start,
        };
        while self
            .snapshots
            .keys()
            .next_back()
            .map_or(true, |&last| last < at_tick)
        {
            let state = self.state_for_snapshot(next);
            self.snapshots.insert(next, state);
            next += stride;
        }

        if self.snapshots.len() > self.config.snapshot_count {
            while self.snapshots.len() > self.config.snapshot_count {
                let oldest = *self.snapshots.keys().next().expect("ring not empty");
                self.snapshots.remove(&oldest);
            }
            let new_start = *self.snapshots.keys().next().expect("capacity is >= 1");
            self.snapshot_start_tick = Some(new_start);
            self.prune_before_tick(new_start);
        }
    }

    fn state_for_snapshot(&self, target_tick: i64) -> Arc<S> {
        let (mut tick, mut state) = match self.snapshots.range(..target_tick).next_back() {
            Some((&snap_tick, snap)) => (snap_tick + 1, Arc::clone(snap)),
            None => (
                self.initial_tick_value.expect("snapshots imply index 0"),
                Arc::clone(&self.initial),
            ),
        };
        while tick <= target_tick {
            state = self.apply_tick(&state, tick);
            tick += 1;
        }
        state
    }

    /// Drop remote history strictly below `tick`, clamped so nothing below
    /// an unproven tick is ever lost. Local predictions stay until their
    /// echo regardless.
    fn prune_before_tick(&mut self, tick: i64) {
        let Some(safe) = self.safe_prune_tick() else {
            return;
        };
        let mut target = tick;
        if safe < target {
            target = safe;
            self.cache_drop_guard_hits += 1;
        }

        let doomed: Vec<i64> = self.timeline.range(..target).map(|(&t, _)| t).collect();
        for t in doomed {
            let bucket = self.timeline.get_mut(&t).expect("collected above");
            for post in bucket.remote.drain(..) {
                self.remote_posts.remove(&(post.index as u64));
            }
            if bucket.local.is_empty() {
                self.timeline.remove(&t);
            }
        }
    }

    /// A post landing before the snapshot window cannot be replayed through
    /// existing snapshots: clear the ring and count the event.
    fn guard_pre_window(&mut self, tick: i64) {
        if !self.config.cache {
            return;
        }
        if let Some(start) = self.snapshot_start_tick {
            if tick < start {
                self.cache_drop_guard_hits += 1;
                self.snapshots.clear();
                self.snapshot_start_tick = None;
            }
        }
    }

    /// Any change to the posts of tick `t` stales every snapshot at `>= t`.
    fn invalidate_snapshots_from(&mut self, tick: i64) {
        if !self.config.cache {
            return;
        }
        let _stale = self.snapshots.split_off(&tick);
        if self.snapshots.is_empty() {
            self.snapshot_start_tick = None;
        }
    }

    /// The tick math and cache shape this core runs with.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Official time of the index-0 post, once seen.
    pub fn initial_time(&self) -> Option<i64> {
        self.initial_time_value
    }

    /// Official tick of the index-0 post, once seen.
    pub fn initial_tick(&self) -> Option<i64> {
        self.initial_tick_value
    }

    /// `max_remote_index + 1`.
    pub fn post_count(&self) -> i64 {
        self.max_remote_index + 1
    }

    /// Highest remote index ever admitted.
    pub fn max_remote_index(&self) -> i64 {
        self.max_remote_index
    }

    /// Largest `k` such that indices `0..=k` have all been seen.
    pub fn max_contiguous_remote_index(&self) -> i64 {
        self.max_contiguous_remote_index
    }

    /// Completeness watermark, milliseconds.
    pub fn no_pending_posts_before_ms(&self) -> Option<i64> {
        self.no_pending_posts_before_ms
    }

    /// Diagnostic counter: ring clears plus clamped prunes.
    pub fn cache_drop_guard_hits(&self) -> u64 {
        self.cache_drop_guard_hits
    }

    /// Whether a local prediction with this name is pending.
    pub fn has_local(&self, name: &str) -> bool {
        self.local_posts.contains_key(name)
    }

    /// Full bookkeeping dump for tests.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            remote_posts: self.remote_posts.len(),
            local_posts: self.local_posts.len(),
            max_remote_index: self.max_remote_index,
            max_contiguous_remote_index: self.max_contiguous_remote_index,
            no_pending_posts_before_ms: self.no_pending_posts_before_ms,
            snapshot_start_tick: self.snapshot_start_tick,
            snapshot_ticks: self.snapshots.keys().copied().collect(),
            timeline: self
                .timeline
                .iter()
                .map(|(&tick, bucket)| {
                    (
                        tick,
                        bucket.remote.iter().map(|p| p.index).collect(),
                        bucket.local.iter().map(|p| p.name.clone()).collect(),
                    )
                })
                .collect(),
            cache_drop_guard_hits: self.cache_drop_guard_hits,
            initial_tick: self.initial_tick_value,
        }
    }
}
