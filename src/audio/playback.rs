//! Playback actor: the single owner of the [`PlaybackScheduler`].
//!
//! Every mutation of the timeline and the active handle set happens on the
//! actor task, in the order commands were sent. Streamed chunks carry the
//! generation of the live session that produced them and are dropped unless
//! that session's stream is the one currently open.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::scheduler::{HandleId, OutputDevice, PlaybackScheduler};
use super::AudioChunk;

enum PlaybackCommand {
    BeginStream { generation: u64 },
    StreamChunk { generation: u64, chunk: AudioChunk },
    Interrupt { generation: u64 },
    EndStream { generation: u64 },
    OneShot { chunk: AudioChunk, done: oneshot::Sender<()> },
    StopAll,
    Snapshot { reply: oneshot::Sender<PlaybackSnapshot> },
}

/// Point-in-time view of the scheduler, for status display and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSnapshot {
    pub device_time: f64,
    pub next_start_time: f64,
    pub active_sources: usize,
    pub stream_generation: Option<u64>,
}

/// Cloneable sender side of the playback actor.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<PlaybackCommand>,
}

impl PlaybackHandle {
    fn send(&self, command: PlaybackCommand) {
        if self.tx.send(command).is_err() {
            tracing::debug!("Playback actor is gone; command dropped");
        }
    }

    /// Open the streaming timeline for a live session, silencing anything playing.
    pub fn begin_stream(&self, generation: u64) {
        self.send(PlaybackCommand::BeginStream { generation });
    }

    pub fn stream_chunk(&self, generation: u64, chunk: AudioChunk) {
        self.send(PlaybackCommand::StreamChunk { generation, chunk });
    }

    /// Barge-in: the user started talking over the model.
    pub fn interrupt(&self, generation: u64) {
        self.send(PlaybackCommand::Interrupt { generation });
    }

    pub fn end_stream(&self, generation: u64) {
        self.send(PlaybackCommand::EndStream { generation });
    }

    /// Play a one-shot synthesis result. The receiver resolves when playback
    /// ends, whether it finished naturally, was stopped, or never started.
    pub fn play_one_shot(&self, chunk: AudioChunk) -> oneshot::Receiver<()> {
        let (done, finished) = oneshot::channel();
        self.send(PlaybackCommand::OneShot { chunk, done });
        finished
    }

    pub fn stop_all(&self) {
        self.send(PlaybackCommand::StopAll);
    }

    pub async fn snapshot(&self) -> Option<PlaybackSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(PlaybackCommand::Snapshot { reply });
        rx.await.ok()
    }
}

struct PlaybackActor<D: OutputDevice> {
    scheduler: PlaybackScheduler<D>,
    stream_generation: Option<u64>,
    one_shots: HashMap<HandleId, oneshot::Sender<()>>,
}

impl<D: OutputDevice> PlaybackActor<D> {
    fn is_current(&self, generation: u64) -> bool {
        self.stream_generation == Some(generation)
    }

    fn stop_all(&mut self) {
        let stopped = self.scheduler.stop_all();
        if !stopped.is_empty() {
            tracing::debug!("Stopped {} playing chunk(s)", stopped.len());
        }
        // Dropping the senders resolves every pending one-shot receiver.
        self.one_shots.clear();
    }

    fn handle(&mut self, command: PlaybackCommand) {
        match command {
            PlaybackCommand::BeginStream { generation } => {
                self.stop_all();
                self.stream_generation = Some(generation);
            }
            PlaybackCommand::StreamChunk { generation, chunk } => {
                if self.is_current(generation) {
                    self.scheduler.schedule_chunk(&chunk);
                } else {
                    tracing::debug!("Discarding chunk from stale session {}", generation);
                }
            }
            PlaybackCommand::Interrupt { generation } => {
                if self.is_current(generation) {
                    tracing::info!("Playback interrupted");
                    self.stop_all();
                }
            }
            PlaybackCommand::EndStream { generation } => {
                if self.is_current(generation) {
                    self.stream_generation = None;
                    self.stop_all();
                }
            }
            PlaybackCommand::OneShot { chunk, done } => {
                if let Some(scheduled) = self.scheduler.play_one_shot(&chunk) {
                    self.one_shots.insert(scheduled.id, done);
                }
            }
            PlaybackCommand::StopAll => self.stop_all(),
            PlaybackCommand::Snapshot { reply } => {
                let _ = reply.send(PlaybackSnapshot {
                    device_time: self.scheduler.device().current_time(),
                    next_start_time: self.scheduler.next_start_time(),
                    active_sources: self.scheduler.active_count(),
                    stream_generation: self.stream_generation,
                });
            }
        }
    }

    fn finished(&mut self, id: HandleId) {
        self.scheduler.finished(id);
        if let Some(done) = self.one_shots.remove(&id) {
            let _ = done.send(());
        }
    }
}

/// Spawn the playback actor on the current tokio runtime.
///
/// `finished` carries handle ids the device reports as played to the end.
pub fn spawn_playback<D>(
    device: D,
    mut finished: mpsc::UnboundedReceiver<HandleId>,
) -> (PlaybackHandle, JoinHandle<()>)
where
    D: OutputDevice + 'static,
{
    let (tx, mut commands) = mpsc::unbounded_channel();
    let mut actor = PlaybackActor {
        scheduler: PlaybackScheduler::new(device),
        stream_generation: None,
        one_shots: HashMap::new(),
    };

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => actor.handle(command),
                    None => break,
                },
                Some(id) = finished.recv() => actor.finished(id),
            }
        }
        actor.stop_all();
        tracing::debug!("Playback actor stopped");
    });

    (PlaybackHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::audio::scheduler::tests::ManualDevice;
    use crate::audio::AudioError;

    #[derive(Clone, Default)]
    struct SharedDevice(Arc<Mutex<ManualDevice>>);

    impl SharedDevice {
        fn set_time(&self, now: f64) {
            self.0.lock().unwrap().now = now;
        }

        fn starts(&self) -> Vec<(HandleId, f64, f64)> {
            self.0.lock().unwrap().started.clone()
        }

        fn stops(&self) -> Vec<HandleId> {
            self.0.lock().unwrap().stopped.clone()
        }
    }

    impl OutputDevice for SharedDevice {
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().current_time()
        }

        fn start(&mut self, id: HandleId, chunk: &AudioChunk, at: f64) -> Result<(), AudioError> {
            self.0.lock().unwrap().start(id, chunk, at)
        }

        fn stop(&mut self, id: HandleId) -> Result<(), AudioError> {
            self.0.lock().unwrap().stop(id)
        }
    }

    fn chunk(seconds: f64) -> AudioChunk {
        AudioChunk::mono(vec![0.0; (seconds * 24000.0) as usize], 24000)
    }

    fn spawn(device: &SharedDevice) -> (PlaybackHandle, mpsc::UnboundedSender<HandleId>) {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let (handle, _task) = spawn_playback(device.clone(), finished_rx);
        (handle, finished_tx)
    }

    #[tokio::test]
    async fn interruption_stops_in_flight_chunks_and_resets_timeline() {
        let device = SharedDevice::default();
        device.set_time(1.0);
        let (playback, _finished) = spawn(&device);

        playback.begin_stream(1);
        for _ in 0..3 {
            playback.stream_chunk(1, chunk(0.5));
        }
        let snapshot = playback.snapshot().await.unwrap();
        assert_eq!(snapshot.active_sources, 3);
        assert!((snapshot.next_start_time - 2.5).abs() < 1e-9);

        let starts: Vec<f64> = device.starts().iter().map(|s| s.1).collect();
        assert_eq!(starts, vec![1.0, 1.5, 2.0]);

        device.set_time(1.2);
        playback.interrupt(1);
        playback.stream_chunk(1, chunk(0.5));

        let snapshot = playback.snapshot().await.unwrap();
        assert_eq!(device.stops().len(), 3);
        assert_eq!(snapshot.active_sources, 1);
        // The post-interruption chunk starts at the device clock, not at 2.5.
        assert_eq!(device.starts().last().unwrap().1, 1.2);
        assert!((snapshot.next_start_time - 1.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn chunks_from_a_closed_session_are_discarded() {
        let device = SharedDevice::default();
        let (playback, _finished) = spawn(&device);

        playback.begin_stream(1);
        playback.stream_chunk(1, chunk(0.5));
        playback.end_stream(1);
        playback.stream_chunk(1, chunk(0.5));

        playback.begin_stream(2);
        playback.stream_chunk(1, chunk(0.5));
        playback.interrupt(1);
        playback.stream_chunk(2, chunk(0.5));

        let snapshot = playback.snapshot().await.unwrap();
        assert_eq!(device.starts().len(), 2);
        assert_eq!(snapshot.active_sources, 1);
        assert_eq!(snapshot.stream_generation, Some(2));
    }

    #[tokio::test]
    async fn finished_chunks_leave_the_active_set() {
        let device = SharedDevice::default();
        let (playback, finished) = spawn(&device);

        playback.begin_stream(4);
        playback.stream_chunk(4, chunk(0.5));
        playback.stream_chunk(4, chunk(0.5));
        playback.snapshot().await.unwrap();

        let first = device.starts()[0].0;
        finished.send(first).unwrap();
        finished.send(first).unwrap();

        // Give the actor a turn to drain the finished channel.
        tokio::task::yield_now().await;
        let mut remaining = playback.snapshot().await.unwrap().active_sources;
        for _ in 0..10 {
            if remaining == 1 {
                break;
            }
            tokio::task::yield_now().await;
            remaining = playback.snapshot().await.unwrap().active_sources;
        }
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn one_shot_completes_when_finished_or_stopped() {
        let device = SharedDevice::default();
        device.set_time(3.0);
        let (playback, finished) = spawn(&device);

        let done = playback.play_one_shot(chunk(2.0));
        playback.snapshot().await.unwrap();
        let (id, start, duration) = device.starts()[0];
        assert_eq!(start, 3.0);
        assert_eq!(duration, 2.0);
        finished.send(id).unwrap();
        assert!(done.await.is_ok());

        let stopped = playback.play_one_shot(chunk(2.0));
        playback.stop_all();
        // Sender dropped by stop_all.
        assert!(stopped.await.is_err());
    }

    #[tokio::test]
    async fn one_shot_does_not_delay_a_fresh_stream() {
        let device = SharedDevice::default();
        device.set_time(10.0);
        let (playback, _finished) = spawn(&device);

        let _speech = playback.play_one_shot(chunk(2.0));
        device.set_time(10.3);
        // The caller opens the stream after the one-shot; that silences it.
        playback.begin_stream(1);
        playback.stream_chunk(1, chunk(0.5));

        let snapshot = playback.snapshot().await.unwrap();
        assert_eq!(device.starts()[1].1, 10.3);
        assert_eq!(snapshot.active_sources, 1);
    }

    #[tokio::test]
    async fn stop_all_twice_is_harmless() {
        let device = SharedDevice::default();
        let (playback, _finished) = spawn(&device);
        playback.stop_all();
        playback.stop_all();
        let snapshot = playback.snapshot().await.unwrap();
        assert_eq!(snapshot.next_start_time, 0.0);
        assert_eq!(snapshot.active_sources, 0);
    }
}
