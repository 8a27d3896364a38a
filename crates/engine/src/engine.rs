//! The engine: a replay core wired to a broker link.
//!
//! The engine is pumped, not called back: the owner drains link events with
//! [`ReplayEngine::pump`] from its own loop (typically once per frame), so
//! every mutation happens on one task and the core needs no locking.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use tickline_codec::{Packed, Value};
use tickline_net::{BrokerLink, LinkEvent};

use crate::core::{
    CoreConfig, Diagnostics, Post, PostFn, ReplayCore, TickFn, DEFAULT_SNAPSHOT_COUNT,
    DEFAULT_SNAPSHOT_STRIDE,
};
use crate::error::EngineError;

/// Interval between latest-index polls.
const LATEST_INDEX_POLL: Duration = Duration::from_secs(2);

/// Blend of a stable past state and the predicted present into what gets
/// rendered.
pub type SmoothFn<S> = Box<dyn Fn(&S, &S) -> S>;

/// Everything needed to construct a [`ReplayEngine`].
pub struct EngineOptions<S> {
    /// Room this engine replays.
    pub room: String,
    /// State before any post.
    pub initial: S,
    /// Pure per-tick transition.
    pub on_tick: TickFn<S>,
    /// Pure per-post transition.
    pub on_post: PostFn<S>,
    /// Payload schema for the room.
    pub packer: Packed,
    /// Simulation ticks per second.
    pub tick_rate: i64,
    /// Clock-skew tolerance, milliseconds.
    pub tolerance_ms: i64,
    /// Optional render blend; defaults to showing the stable past state.
    pub smooth: Option<SmoothFn<S>>,
    /// Snapshot cache toggle.
    pub cache: bool,
    /// Ticks between snapshots.
    pub snapshot_stride: i64,
    /// Snapshot ring capacity.
    pub snapshot_count: usize,
}

impl<S> EngineOptions<S> {
    /// Options with the default cache shape and no smoothing.
    pub fn new(
        room: impl Into<String>,
        initial: S,
        on_tick: TickFn<S>,
        on_post: PostFn<S>,
        packer: Packed,
        tick_rate: i64,
        tolerance_ms: i64,
    ) -> Self {
        Self {
            room: room.into(),
            initial,
            on_tick,
            on_post,
            packer,
            tick_rate,
            tolerance_ms,
            smooth: None,
            cache: true,
            snapshot_stride: DEFAULT_SNAPSHOT_STRIDE,
            snapshot_count: DEFAULT_SNAPSHOT_COUNT,
        }
    }

    /// Install a render blend.
    pub fn with_smooth(mut self, smooth: SmoothFn<S>) -> Self {
        self.smooth = Some(smooth);
        self
    }

    /// Toggle the snapshot cache.
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    /// Override the snapshot stride.
    pub fn with_snapshot_stride(mut self, stride: i64) -> Self {
        assert!(stride >= 1, "snapshot stride must be at least 1");
        self.snapshot_stride = stride;
        self
    }

    /// Override the snapshot ring capacity.
    pub fn with_snapshot_count(mut self, count: usize) -> Self {
        assert!(count >= 1, "snapshot count must be at least 1");
        self.snapshot_count = count;
        self
    }
}

/// A replay core bound to one room over one broker link.
pub struct ReplayEngine<S, L: BrokerLink> {
    core: ReplayCore<S>,
    link: L,
    room: String,
    packer: Packed,
    smooth: Option<SmoothFn<S>>,
    started: bool,
    closed: bool,
    last_latest_poll: Option<Instant>,
}

impl<S, L: BrokerLink> ReplayEngine<S, L> {
    /// Bind an engine to an injected link (production client or test
    /// double).
    pub fn with_link(options: EngineOptions<S>, link: L) -> Self {
        let mut config = CoreConfig::new(options.tick_rate, options.tolerance_ms);
        config.cache = options.cache;
        config.snapshot_stride = options.snapshot_stride;
        config.snapshot_count = options.snapshot_count;
        Self {
            core: ReplayCore::new(config, options.initial, options.on_tick, options.on_post),
            link,
            room: options.room,
            packer: options.packer,
            smooth: options.smooth,
            started: false,
            closed: false,
            last_latest_poll: None,
        }
    }

    /// Drain link events and run the periodic latest-index poll.
    ///
    /// Call this from the owner's loop before reading any state.
    pub fn pump(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }

        while let Some(event) = self.link.poll_event() {
            match event {
                LinkEvent::Synced => self.start()?,
                LinkEvent::Post(record) => {
                    if record.room != self.room {
                        continue;
                    }
                    self.core.admit_remote(Post {
                        index: record.index as i64,
                        server_time: record.server_time,
                        client_time: record.client_time,
                        name: record.name,
                        data: record.data,
                    });
                }
                LinkEvent::LatestIndex {
                    room,
                    latest_index,
                    server_time,
                } => {
                    if room != self.room {
                        continue;
                    }
                    self.core.note_latest_index(latest_index, server_time);
                }
            }
        }

        // The link may have synced before this engine attached to it.
        if !self.started && self.link.synced() {
            self.start()?;
        }

        if self.started
            && self
                .last_latest_poll
                .map_or(true, |at| at.elapsed() >= LATEST_INDEX_POLL)
        {
            self.link.request_latest_index(&self.room)?;
            self.last_latest_poll = Some(Instant::now());
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if self.started {
            return Ok(());
        }
        debug!(room = %self.room, "transport synced, loading history");
        self.link.load(&self.room, 0, &self.packer)?;
        self.link.watch(&self.room, &self.packer)?;
        self.started = true;
        Ok(())
    }

    /// Submit an input: predict it locally and hand it to the broker.
    ///
    /// Returns the generated name; the prediction is replaced by its
    /// authoritative echo when that arrives.
    pub fn post(&mut self, data: Value) -> Result<String, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        let now = self.link.server_time()?;
        let name = self.link.post(&self.room, &data)?;
        self.core.admit_local(Post {
            index: -1,
            server_time: now,
            client_time: now,
            name: name.clone(),
            data,
        });
        Ok(name)
    }

    /// Current estimate of the broker clock, milliseconds.
    pub fn server_time(&self) -> Result<i64, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        Ok(self.link.server_time()?)
    }

    /// Current broker tick.
    pub fn server_tick(&self) -> Result<i64, EngineError> {
        Ok(self.core.tick_of_time(self.server_time()?))
    }

    /// Most recent round-trip time, milliseconds.
    pub fn ping(&self) -> Option<i64> {
        self.link.ping()
    }

    /// Whether the broker clock has synced at least once. Until then every
    /// time-derived operation fails fast.
    pub fn synced(&self) -> bool {
        !self.closed && self.link.synced()
    }

    /// State after everything through `tick`.
    pub fn compute_state_at(&mut self, tick: i64) -> Arc<S> {
        self.core.compute_state_at(tick)
    }

    /// State at the current broker tick, predictions included.
    pub fn compute_current_state(&mut self) -> Result<Arc<S>, EngineError> {
        let tick = self.server_tick()?;
        Ok(self.core.compute_state_at(tick))
    }

    /// Compose the render state: a stable past state lagged behind the
    /// latency horizon, blended with the predicted present.
    pub fn compute_render_state(&mut self) -> Result<Arc<S>, EngineError> {
        let curr = self.server_tick()?;
        let tick_rate = self.core.config().tick_rate;
        let tolerance = self.core.config().tolerance_ms;

        let tol_ticks = {
            let n = tolerance * tick_rate;
            (n + 999).div_euclid(1000)
        };
        let half_rtt_ticks = match self.link.ping() {
            Some(ping) => {
                let n = (ping / 2) * tick_rate;
                (n + 999).div_euclid(1000)
            }
            None => 0,
        };
        let remote_lag = tol_ticks.max(half_rtt_ticks + 1);
        let remote_tick = (curr - remote_lag).max(0);

        let remote = self.core.compute_state_at(remote_tick);
        let local = self.core.compute_state_at(curr);
        Ok(match &self.smooth {
            Some(smooth) => Arc::new(smooth(&remote, &local)),
            None => remote,
        })
    }

    /// `max_remote_index + 1`.
    pub fn post_count(&self) -> i64 {
        self.core.post_count()
    }

    /// Official time of the index-0 post, once seen.
    pub fn initial_time(&self) -> Option<i64> {
        self.core.initial_time()
    }

    /// Official tick of the index-0 post, once seen.
    pub fn initial_tick(&self) -> Option<i64> {
        self.core.initial_tick()
    }

    /// Room this engine replays.
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Read access to the replay core.
    pub fn core(&self) -> &ReplayCore<S> {
        &self.core
    }

    /// Mutable access to the link (test doubles are driven through this).
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Bookkeeping dump for tests and debugging.
    pub fn diagnostics(&self) -> Diagnostics {
        self.core.diagnostics()
    }

    /// Stop timers and tear down the link. Further operations fail with
    /// [`EngineError::Closed`].
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.link.close();
        }
    }
}
