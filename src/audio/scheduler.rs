//! Gapless playback timeline for streamed and one-shot audio chunks.
//!
//! The scheduler owns the `next_start_time` scalar and the set of active
//! playback handles. It never touches audio samples itself; it only decides
//! *when* each chunk starts and asks an [`OutputDevice`] to play it.

use std::collections::HashMap;

use super::{AudioChunk, AudioError};

/// Identifier of one scheduled chunk. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

/// Output device seam: a clock plus start/stop of individual handles.
pub trait OutputDevice: Send {
    /// Current time on the device clock, in seconds.
    fn current_time(&self) -> f64;

    /// Start playing `chunk` at device time `at` (seconds).
    fn start(&mut self, id: HandleId, chunk: &AudioChunk, at: f64) -> Result<(), AudioError>;

    /// Stop a handle immediately. May fail if the handle already finished.
    fn stop(&mut self, id: HandleId) -> Result<(), AudioError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: HandleId,
    pub start: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, Copy)]
struct ActiveSource {
    start: f64,
    duration: f64,
}

pub struct PlaybackScheduler<D: OutputDevice> {
    device: D,
    next_start_time: f64,
    active: HashMap<HandleId, ActiveSource>,
    next_id: u64,
}

impl<D: OutputDevice> PlaybackScheduler<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            next_start_time: 0.0,
            active: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    #[cfg(test)]
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    fn allocate_id(&mut self) -> HandleId {
        let id = HandleId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Queue a streamed chunk directly after the previous one.
    ///
    /// Starts at `max(next_start_time, now)`, so a chunk that arrives after the
    /// timeline has already drained starts immediately. Returns `None` when the
    /// device refused the chunk; the timeline still advances past it.
    pub fn schedule_chunk(&mut self, chunk: &AudioChunk) -> Option<ScheduledChunk> {
        let now = self.device.current_time();
        let start = self.next_start_time.max(now);
        let duration = chunk.duration();
        self.next_start_time = start + duration;

        let id = self.allocate_id();
        match self.device.start(id, chunk, start) {
            Ok(()) => {
                self.active.insert(id, ActiveSource { start, duration });
                tracing::trace!("Scheduled chunk {:?} at {:.3}s for {:.3}s", id, start, duration);
                Some(ScheduledChunk { id, start, duration })
            }
            Err(e) => {
                tracing::warn!("Dropping audio chunk: {}", e);
                None
            }
        }
    }

    /// Play a single chunk right now, outside the streaming timeline.
    pub fn play_one_shot(&mut self, chunk: &AudioChunk) -> Option<ScheduledChunk> {
        let start = self.device.current_time();
        let duration = chunk.duration();

        let id = self.allocate_id();
        match self.device.start(id, chunk, start) {
            Ok(()) => {
                self.active.insert(id, ActiveSource { start, duration });
                Some(ScheduledChunk { id, start, duration })
            }
            Err(e) => {
                tracing::warn!("Dropping one-shot audio: {}", e);
                None
            }
        }
    }

    /// Stop every active handle and reset the timeline to zero.
    pub fn stop_all(&mut self) -> Vec<HandleId> {
        let stopped: Vec<HandleId> = self.active.drain().map(|(id, _)| id).collect();
        for id in &stopped {
            if let Err(e) = self.device.stop(*id) {
                tracing::debug!("Handle {:?} already stopped: {}", id, e);
            }
        }
        self.next_start_time = 0.0;
        stopped
    }

    /// Device notification that a handle played to the end.
    ///
    /// Returns false for handles that were already removed by `stop_all`.
    pub fn finished(&mut self, id: HandleId) -> bool {
        match self.active.remove(&id) {
            Some(source) => {
                tracing::trace!(
                    "Chunk {:?} finished ({:.3}s + {:.3}s)",
                    id,
                    source.start,
                    source.duration
                );
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Device with a hand-driven clock that records every call.
    #[derive(Default)]
    pub(crate) struct ManualDevice {
        pub now: f64,
        pub started: Vec<(HandleId, f64, f64)>,
        pub stopped: Vec<HandleId>,
        pub fail_next_start: bool,
        pub fail_stops: bool,
    }

    impl OutputDevice for ManualDevice {
        fn current_time(&self) -> f64 {
            self.now
        }

        fn start(&mut self, id: HandleId, chunk: &AudioChunk, at: f64) -> Result<(), AudioError> {
            if std::mem::take(&mut self.fail_next_start) {
                return Err(AudioError::Device("device suspended".into()));
            }
            self.started.push((id, at, chunk.duration()));
            Ok(())
        }

        fn stop(&mut self, id: HandleId) -> Result<(), AudioError> {
            self.stopped.push(id);
            if self.fail_stops {
                return Err(AudioError::Device("already stopped".into()));
            }
            Ok(())
        }
    }

    fn chunk(seconds: f64) -> AudioChunk {
        AudioChunk::mono(vec![0.0; (seconds * 24000.0) as usize], 24000)
    }

    #[test]
    fn consecutive_chunks_are_gapless_and_ordered() {
        let mut scheduler = PlaybackScheduler::new(ManualDevice { now: 1.0, ..Default::default() });
        let durations = [0.5, 0.25, 1.0, 0.125];

        let scheduled: Vec<ScheduledChunk> = durations
            .iter()
            .map(|&d| scheduler.schedule_chunk(&chunk(d)).unwrap())
            .collect();

        let first = scheduled[0].start;
        assert_eq!(first, 1.0);
        let mut expected = first;
        for (k, s) in scheduled.iter().enumerate() {
            assert!((s.start - expected).abs() < 1e-9, "chunk {} started at {}", k, s.start);
            expected += durations[k];
        }
        assert!((scheduler.next_start_time() - expected).abs() < 1e-9);
        assert_eq!(scheduler.active_count(), 4);

        let ids: Vec<HandleId> = scheduler.device().started.iter().map(|s| s.0).collect();
        assert_eq!(ids, scheduled.iter().map(|s| s.id).collect::<Vec<_>>());
    }

    #[test]
    fn late_chunk_starts_immediately() {
        let mut scheduler = PlaybackScheduler::new(ManualDevice::default());
        scheduler.schedule_chunk(&chunk(0.5)).unwrap();

        // The device ran past the end of the queued audio.
        scheduler.device_mut().now = 3.0;
        let late = scheduler.schedule_chunk(&chunk(0.5)).unwrap();
        assert_eq!(late.start, 3.0);
        assert!((scheduler.next_start_time() - 3.5).abs() < 1e-9);
    }

    #[test]
    fn stop_all_resets_timeline_and_next_chunk_uses_device_time() {
        let mut scheduler = PlaybackScheduler::new(ManualDevice { now: 2.0, ..Default::default() });
        scheduler.schedule_chunk(&chunk(1.0)).unwrap();
        scheduler.schedule_chunk(&chunk(1.0)).unwrap();
        assert!((scheduler.next_start_time() - 4.0).abs() < 1e-9);

        scheduler.device_mut().now = 2.5;
        let stopped = scheduler.stop_all();
        assert_eq!(stopped.len(), 2);
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert_eq!(scheduler.active_count(), 0);

        let fresh = scheduler.schedule_chunk(&chunk(0.5)).unwrap();
        assert_eq!(fresh.start, 2.5);
    }

    #[test]
    fn stop_all_is_idempotent() {
        let mut scheduler = PlaybackScheduler::new(ManualDevice::default());
        assert!(scheduler.stop_all().is_empty());
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert!(scheduler.stop_all().is_empty());
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert!(scheduler.device().stopped.is_empty());
    }

    #[test]
    fn stop_errors_are_swallowed() {
        let mut scheduler = PlaybackScheduler::new(ManualDevice { fail_stops: true, ..Default::default() });
        scheduler.schedule_chunk(&chunk(0.5)).unwrap();
        scheduler.schedule_chunk(&chunk(0.5)).unwrap();
        assert_eq!(scheduler.stop_all().len(), 2);
        assert_eq!(scheduler.device().stopped.len(), 2);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn handles_are_removed_exactly_once() {
        let mut scheduler = PlaybackScheduler::new(ManualDevice::default());
        let a = scheduler.schedule_chunk(&chunk(0.5)).unwrap();
        let b = scheduler.schedule_chunk(&chunk(0.5)).unwrap();

        assert!(scheduler.finished(a.id));
        assert!(!scheduler.finished(a.id));
        assert_eq!(scheduler.active_count(), 1);

        scheduler.stop_all();
        // The device may still report the stopped handle as finished.
        assert!(!scheduler.finished(b.id));
        assert_eq!(scheduler.device().stopped, vec![b.id]);
    }

    #[test]
    fn device_failure_drops_chunk_without_rewinding() {
        let mut scheduler = PlaybackScheduler::new(ManualDevice::default());
        scheduler.schedule_chunk(&chunk(0.5)).unwrap();

        scheduler.device_mut().fail_next_start = true;
        assert!(scheduler.schedule_chunk(&chunk(0.5)).is_none());
        assert_eq!(scheduler.active_count(), 1);
        assert!((scheduler.next_start_time() - 1.0).abs() < 1e-9);

        let next = scheduler.schedule_chunk(&chunk(0.5)).unwrap();
        assert!((next.start - 1.0).abs() < 1e-9);
    }

    #[test]
    fn interruption_stops_in_flight_chunks() {
        let mut scheduler = PlaybackScheduler::new(ManualDevice { now: 0.2, ..Default::default() });
        let ids: Vec<HandleId> = (0..3)
            .map(|_| scheduler.schedule_chunk(&chunk(0.5)).unwrap().id)
            .collect();
        assert!((scheduler.next_start_time() - 1.7).abs() < 1e-9);

        scheduler.device_mut().now = 0.4;
        let mut stopped = scheduler.stop_all();
        stopped.sort();
        assert_eq!(stopped, ids);

        let fourth = scheduler.schedule_chunk(&chunk(0.5)).unwrap();
        assert_eq!(fourth.start, 0.4);
    }

    #[test]
    fn one_shot_does_not_touch_streaming_timeline() {
        let mut scheduler = PlaybackScheduler::new(ManualDevice { now: 5.0, ..Default::default() });
        let speech = scheduler.play_one_shot(&chunk(2.0)).unwrap();
        assert_eq!(speech.start, 5.0);
        assert_eq!(scheduler.next_start_time(), 0.0);

        scheduler.device_mut().now = 5.1;
        let first = scheduler.schedule_chunk(&chunk(0.5)).unwrap();
        assert_eq!(first.start, 5.1);
        assert_eq!(scheduler.active_count(), 2);
    }
}
