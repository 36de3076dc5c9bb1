// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background frame decoding for animated playback.
//!
//! One worker thread owns a [`GifDecoder`]. Each decoded frame is copied out
//! and handed over through a single-slot channel, after which the worker waits
//! for [`Animator::acknowledge`] before it touches the canvas again. A render
//! loop therefore polls, shows the frame for its delay, then acknowledges.

use log::debug;

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::container::GifContainer;
use crate::decoder::FrameRef;
use crate::{DecodeConfig, Error, GifDecoder, Result, Stop, StopReason};

/// Shared cancellation token; clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Stop for CancelFlag {
    fn check(&self) -> Result<(), StopReason> {
        if self.is_cancelled() {
            Err(StopReason::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What the worker reports to the consumer.
#[derive(Debug)]
pub enum AnimationEvent {
    /// A frame ready to display; acknowledge it to get the next one.
    Frame(FrameRef<'static>),
    /// Playback ended normally. No further events follow.
    Finished,
    /// Decoding failed. No further events follow.
    Failed(Error),
}

struct Link {
    events: Receiver<AnimationEvent>,
    acks: SyncSender<()>,
}

/// Decodes a GIF on a dedicated thread, one frame per acknowledgement.
///
/// Dropping the animator cancels the worker and joins it.
pub struct Animator {
    container: GifContainer,
    cancel: CancelFlag,
    link: Option<Link>,
    worker: Option<JoinHandle<()>>,
}

impl Animator {
    /// Start decoding `data` in the background.
    pub fn spawn(data: Arc<[u8]>, config: DecodeConfig) -> Result<Self> {
        Self::spawn_with_cancel(data, config, CancelFlag::new())
    }

    /// Like [`Self::spawn`], observing a cancellation flag the caller keeps.
    pub fn spawn_with_cancel(data: Arc<[u8]>, config: DecodeConfig, cancel: CancelFlag) -> Result<Self> {
        let container = GifContainer::parse(&data);
        let (event_tx, events) = mpsc::sync_channel(1);
        let (acks, ack_rx) = mpsc::sync_channel(1);

        let worker_cancel = cancel.clone();
        let worker_container = container.clone();
        let worker = thread::Builder::new()
            .name("gif-decode".into())
            .spawn(move || {
                let decoder = GifDecoder::with_container(Cow::Borrowed(&data[..]), worker_container, &config);
                run(decoder, &config, &event_tx, &ack_rx, &worker_cancel)
            })?;

        Ok(Self {
            container,
            cancel,
            link: Some(Link { events, acks }),
            worker: Some(worker),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.container.is_valid()
    }

    /// Intrinsic width, known without waiting for the worker.
    pub fn width(&self) -> u16 {
        self.container.width()
    }

    /// Intrinsic height, known without waiting for the worker.
    pub fn height(&self) -> u16 {
        self.container.height()
    }

    /// The pending event, if the worker has produced one. Never blocks.
    pub fn poll(&self) -> Option<AnimationEvent> {
        self.link.as_ref()?.events.try_recv().ok()
    }

    /// Block until the worker produces an event. `None` once the worker has
    /// exited and every event was taken.
    pub fn wait(&self) -> Option<AnimationEvent> {
        self.link.as_ref()?.events.recv().ok()
    }

    /// Let the worker decode the next frame. Returns false once the worker is
    /// gone. Acknowledging twice before the worker wakes counts once.
    pub fn acknowledge(&self) -> bool {
        let Some(link) = self.link.as_ref() else {
            return false;
        };
        match link.acks.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Disconnected(())) => false,
        }
    }

    /// Ask the worker to stop. It finishes any frame in progress and exits
    /// without producing further events.
    pub fn cancel(&self) {
        self.cancel.cancel();
        // wake a worker parked on the acknowledgement
        self.acknowledge();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Animator {
    fn drop(&mut self) {
        self.cancel.cancel();
        // closing both channels unblocks the worker wherever it waits
        self.link = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                debug!("gif decode thread panicked");
            }
        }
    }
}

fn run(
    mut decoder: GifDecoder<'_>,
    config: &DecodeConfig,
    events: &SyncSender<AnimationEvent>,
    acks: &Receiver<()>,
    cancel: &CancelFlag,
) {
    if !config.auto_start && acks.recv().is_err() {
        return;
    }

    loop {
        if let Err(reason) = cancel.check() {
            debug!("gif decode thread stopping: {reason}");
            return;
        }
        let event = match decoder.decode_next() {
            Ok(Some(frame)) => match frame.into_owned() {
                Ok(frame) => AnimationEvent::Frame(frame),
                Err(err) => AnimationEvent::Failed(err),
            },
            Ok(None) => AnimationEvent::Finished,
            Err(err) => AnimationEvent::Failed(err),
        };
        let done = !matches!(event, AnimationEvent::Frame(_));
        if events.send(event).is_err() || done {
            return;
        }
        if acks.recv().is_err() {
            return;
        }
    }
}
