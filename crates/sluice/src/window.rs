//! Sliding window of frame processors
//!
//! A fixed-capacity ring of frames keyed by a monotonically advancing
//! sequence number. Each record is routed to the frame owning its sequence;
//! frames that slide out of the window are finalized asynchronously and
//! their results discarded. Sequences are assumed dense and roughly
//! incremental; records too far behind or ahead are dropped and counted.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::{Deadline, Processor, Record, SharedProcessor, Value};
use crate::error::Result;
use crate::metrics::{report_int, VarInt};

/// Sequence number of a window frame.
pub type SeqId = i64;

/// Extracts the sequence a record belongs to.
pub type SeqFn = Arc<dyn Fn(&Record) -> SeqId + Send + Sync>;

/// Builds the processor for a newly opened frame.
pub type FrameFactory = Arc<dyn Fn(&str, SeqId) -> Result<SharedProcessor> + Send + Sync>;

/// Window configuration.
#[derive(Clone)]
pub struct WindowSpec {
    /// Metrics namespace.
    pub name: String,
    pub frame_factory: FrameFactory,
    pub seq_fn: SeqFn,
    /// Number of ring slots; the window covers sequences
    /// `[start_seq, start_seq + window_size)`.
    pub window_size: usize,
    /// When positive, records more than this far ahead of `start_seq` are
    /// dropped instead of sliding the window arbitrarily far.
    pub max_seq_advance: i64,
}

impl WindowSpec {
    pub fn new(name: impl Into<String>, frame_factory: FrameFactory, seq_fn: SeqFn) -> Self {
        Self {
            name: name.into(),
            frame_factory,
            seq_fn,
            window_size: 1,
            max_seq_advance: 0,
        }
    }

    pub fn window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(1);
        self
    }

    pub fn max_seq_advance(mut self, max_seq_advance: i64) -> Self {
        self.max_seq_advance = max_seq_advance;
        self
    }
}

struct WindowState {
    frames: Vec<Option<SharedProcessor>>,
    start_seq: SeqId,
    latest_seq: SeqId,
    start_idx: usize,
    has_data: bool,
    /// Outstanding asynchronous frame finalizations.
    pending: Vec<JoinHandle<()>>,
}

impl WindowState {
    fn index_for_offset(&self, offset: usize) -> usize {
        (self.start_idx + offset) % self.frames.len()
    }
}

/// Ring of frames with asynchronous finalization of evicted frames.
///
/// One lock guards slot allocation and head movement; the record itself is
/// fed to the prepared frame outside that lock. The ring guarantees at most
/// one live processor per sequence, so feeds for one frame are serialized
/// as long as this window is the frame's only feeder; a frame shared with
/// other sources must tolerate concurrent feeds itself.
pub struct Window {
    spec: WindowSpec,
    state: Mutex<WindowState>,
    dropped_var: VarInt,
}

impl Window {
    pub fn new(spec: WindowSpec) -> Self {
        let dropped_var = report_int(&spec.name, "droppedCount");
        let state = WindowState {
            frames: (0..spec.window_size.max(1)).map(|_| None).collect(),
            start_seq: 0,
            latest_seq: 0,
            start_idx: 0,
            has_data: false,
            pending: Vec::new(),
        };
        Self {
            spec,
            state: Mutex::new(state),
            dropped_var,
        }
    }

    /// Fire-and-forget finalize of an evicted frame; the window's own
    /// finalize joins every task scheduled here.
    fn schedule_finalize(&self, state: &mut WindowState, seq: SeqId, frame: SharedProcessor) {
        let name = self.spec.name.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = frame.finalize(&Deadline::none()).await {
                debug!(window = %name, seq, %err, "evicted frame finalize failed");
            }
        });
        state.pending.push(handle);
    }

    /// Locate (or create) the frame for the record's sequence, sliding the
    /// window when the sequence runs past the ring. `None` means the record
    /// is out of range and has been counted as dropped.
    fn prepare_frame(&self, record: &Record) -> Result<Option<SharedProcessor>> {
        let seq = (self.spec.seq_fn)(record);
        let mut state = self.state.lock();

        if !state.has_data {
            let frame = (self.spec.frame_factory)(&self.spec.name, seq)?;
            state.start_seq = seq;
            state.latest_seq = seq;
            state.start_idx = 0;
            state.frames[0] = Some(frame.clone());
            state.has_data = true;
            return Ok(Some(frame));
        }

        let offset = seq - state.start_seq;
        if offset < 0 || (self.spec.max_seq_advance > 0 && offset > self.spec.max_seq_advance) {
            self.dropped_var.add(1);
            return Ok(None);
        }

        let win_size = state.frames.len() as i64;
        if offset < win_size {
            let slot = state.index_for_offset(offset as usize);
            if state.frames[slot].is_none() {
                state.frames[slot] = Some((self.spec.frame_factory)(&self.spec.name, seq)?);
            }
            return Ok(state.frames[slot].clone());
        }

        // The window must slide.
        let frame = (self.spec.frame_factory)(&self.spec.name, seq)?;
        state.latest_seq = state.latest_seq.max(seq);
        if offset >= win_size * 2 {
            // The jump clears the whole ring: evict everything and restart
            // with the new sequence in the last slot.
            for i in 0..state.frames.len() {
                let slot = state.index_for_offset(i);
                if let Some(evicted) = state.frames[slot].take() {
                    let evicted_seq = state.start_seq + i as i64;
                    self.schedule_finalize(&mut state, evicted_seq, evicted);
                }
            }
            state.start_seq = seq - win_size + 1;
            state.start_idx = 0;
        } else {
            for _ in 0..(offset - win_size + 1) {
                let start_idx = state.start_idx;
                if let Some(evicted) = state.frames[start_idx].take() {
                    let evicted_seq = state.start_seq;
                    self.schedule_finalize(&mut state, evicted_seq, evicted);
                }
                state.start_idx = state.index_for_offset(1);
                state.start_seq += 1;
            }
        }
        let slot = state.index_for_offset((seq - state.start_seq) as usize);
        state.frames[slot] = Some(frame.clone());
        Ok(Some(frame))
    }

    /// Latest frame and its sequence, or `None` before any data. The frame
    /// is returned unlocked and may be concurrently fed or finalized.
    pub fn latest_frame(&self) -> Option<(SeqId, SharedProcessor)> {
        let state = self.state.lock();
        if !state.has_data {
            return None;
        }
        let slot = state.index_for_offset((state.latest_seq - state.start_seq) as usize);
        state
            .frames[slot]
            .clone()
            .map(|frame| (state.latest_seq, frame))
    }

    /// Every live frame with its sequence, in sequence order. Frames are
    /// returned unlocked; see [`latest_frame`](Window::latest_frame).
    pub fn all_frames(&self) -> Vec<(SeqId, SharedProcessor)> {
        let state = self.state.lock();
        if !state.has_data {
            return Vec::new();
        }
        let mut output = Vec::new();
        for i in 0..state.frames.len() {
            if let Some(frame) = &state.frames[state.index_for_offset(i)] {
                output.push((state.start_seq + i as i64, frame.clone()));
            }
        }
        output
    }
}

#[async_trait]
impl Processor for Window {
    async fn feed(&self, record: Record) -> Result<()> {
        match self.prepare_frame(&record)? {
            Some(frame) => frame.feed(record).await,
            None => Ok(()),
        }
    }

    /// Schedule finalization of every remaining frame, reset, and wait for
    /// all outstanding finalizations, including earlier evictions. Frame
    /// results are discarded, so the window itself contributes nothing.
    async fn finalize(&self, _deadline: &Deadline) -> Result<Option<Value>> {
        let pending = {
            let mut state = self.state.lock();
            for i in 0..state.frames.len() {
                let slot = state.index_for_offset(i);
                if let Some(frame) = state.frames[slot].take() {
                    let seq = state.start_seq + i as i64;
                    self.schedule_finalize(&mut state, seq, frame);
                }
            }
            state.start_seq = 0;
            state.latest_seq = 0;
            state.start_idx = 0;
            state.has_data = false;
            std::mem::take(&mut state.pending)
        };
        for handle in pending {
            if let Err(err) = handle.await {
                debug!(window = %self.spec.name, %err, "frame finalize task failed");
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SluiceError;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        format!("{}_{}", tag, NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Frame that records which sequences got finalized.
    struct TraceFrame {
        seq: SeqId,
        finalized: Arc<PlMutex<Vec<SeqId>>>,
        fed: Arc<PlMutex<Vec<(SeqId, f64)>>>,
    }

    #[async_trait]
    impl Processor for TraceFrame {
        async fn feed(&self, record: Record) -> Result<()> {
            self.fed
                .lock()
                .push((self.seq, record.value.as_metric()?));
            Ok(())
        }

        async fn finalize(&self, _deadline: &Deadline) -> Result<Option<Value>> {
            self.finalized.lock().push(self.seq);
            Ok(None)
        }
    }

    struct Fixture {
        window: Window,
        finalized: Arc<PlMutex<Vec<SeqId>>>,
        fed: Arc<PlMutex<Vec<(SeqId, f64)>>>,
        dropped: VarInt,
    }

    fn fixture(window_size: usize, max_seq_advance: i64) -> Fixture {
        let name = unique_name("win");
        let finalized = Arc::new(PlMutex::new(Vec::new()));
        let fed = Arc::new(PlMutex::new(Vec::new()));
        let factory: FrameFactory = {
            let finalized = finalized.clone();
            let fed = fed.clone();
            Arc::new(move |_name, seq| {
                Ok(Arc::new(TraceFrame {
                    seq,
                    finalized: finalized.clone(),
                    fed: fed.clone(),
                }) as SharedProcessor)
            })
        };
        let seq_fn: SeqFn = Arc::new(|record| record.sort_order as SeqId);
        let spec = WindowSpec::new(name.clone(), factory, seq_fn)
            .window_size(window_size)
            .max_seq_advance(max_seq_advance);
        let dropped = report_int(&name, "droppedCount");
        Fixture {
            window: Window::new(spec),
            finalized,
            fed,
            dropped,
        }
    }

    async fn feed_seq(window: &Window, seq: i64) {
        window
            .feed(Record::new("k", 1.0).with_sort_order(seq as u64))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_window_records_route_to_frames() {
        let fx = fixture(3, 0);
        for seq in [5, 6, 7, 5] {
            feed_seq(&fx.window, seq).await;
        }
        let live: Vec<SeqId> = fx.window.all_frames().iter().map(|(s, _)| *s).collect();
        assert_eq!(live, vec![5, 6, 7]);
        assert_eq!(fx.finalized.lock().len(), 0);
        assert_eq!(fx.fed.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_slide_evicts_head_frames() {
        let fx = fixture(3, 0);
        for seq in [0, 1, 2, 3] {
            feed_seq(&fx.window, seq).await;
        }
        // Sliding to cover seq 3 evicts seq 0.
        fx.window.finalize(&Deadline::none()).await.unwrap();
        let mut finalized = fx.finalized.lock().clone();
        finalized.sort_unstable();
        assert_eq!(finalized, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_eviction_and_drop_accounting() {
        let fx = fixture(3, 0);
        for seq in [0, 1, 2, 1, 3, 7, 7, 1] {
            feed_seq(&fx.window, seq).await;
        }

        // seq 3 slides out frame 0; the jump to 7 clears frames 1..=3 and
        // restarts the window at [5, 7]; the final seq-1 record is behind
        // the window and dropped, counted exactly once.
        assert_eq!(fx.dropped.get(), 1);
        let live: Vec<SeqId> = fx.window.all_frames().iter().map(|(s, _)| *s).collect();
        assert_eq!(live, vec![7]);
        assert_eq!(fx.window.latest_frame().map(|(s, _)| s), Some(7));

        fx.window.finalize(&Deadline::none()).await.unwrap();
        let mut finalized = fx.finalized.lock().clone();
        finalized.sort_unstable();
        assert_eq!(finalized, vec![0, 1, 2, 3, 7]);

        // Both seq-1 records before eviction reached the frame; the one
        // after eviction did not.
        let seq1_feeds = fx.fed.lock().iter().filter(|(s, _)| *s == 1).count();
        assert_eq!(seq1_feeds, 2);
    }

    #[tokio::test]
    async fn test_max_seq_advance_drops_far_ahead() {
        let fx = fixture(3, 10);
        feed_seq(&fx.window, 0).await;
        feed_seq(&fx.window, 100).await;
        assert_eq!(fx.dropped.get(), 1);
        let live: Vec<SeqId> = fx.window.all_frames().iter().map(|(s, _)| *s).collect();
        assert_eq!(live, vec![0]);
    }

    #[tokio::test]
    async fn test_live_frames_bounded_by_window_size() {
        let fx = fixture(4, 0);
        for seq in 0..50 {
            feed_seq(&fx.window, seq).await;
            let seqs: Vec<SeqId> = fx.window.all_frames().iter().map(|(s, _)| *s).collect();
            assert!(seqs.len() <= 4);
            let lowest = seqs.iter().min().copied().unwrap_or(0);
            let highest = seqs.iter().max().copied().unwrap_or(0);
            assert!(highest - lowest <= 3, "frames span too far: {:?}", seqs);
            assert_eq!(highest, seq);
        }
    }

    #[tokio::test]
    async fn test_finalize_waits_for_evictions() {
        let fx = fixture(2, 0);
        for seq in 0..20 {
            feed_seq(&fx.window, seq).await;
        }
        fx.window.finalize(&Deadline::none()).await.unwrap();
        // Every frame ever opened has been finalized by the time finalize
        // returns, including the fire-and-forget evictions.
        let mut finalized = fx.finalized.lock().clone();
        finalized.sort_unstable();
        assert_eq!(finalized, (0..20).collect::<Vec<_>>());
        assert!(fx.window.all_frames().is_empty());
        assert!(fx.window.latest_frame().is_none());
    }

    #[tokio::test]
    async fn test_factory_error_propagates() {
        let factory: FrameFactory = Arc::new(|_, _| {
            Err(SluiceError::Unexpected("no frame".to_string()))
        });
        let seq_fn: SeqFn = Arc::new(|record| record.sort_order as SeqId);
        let window = Window::new(
            WindowSpec::new(unique_name("win"), factory, seq_fn).window_size(2),
        );
        assert!(window.feed(Record::new("k", 1.0)).await.is_err());
    }
}
