//! Buffered, ordered, seekable byte stream over a segment list.
//!
//! The coordinator/fetcher-pool shape is grounded on `streamer::webm_stream`'s
//! task/`tracing` span idiom: a small number of worker tasks feed a shared
//! buffer while a single reader drains it in order.

pub mod window;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{instrument, warn, Instrument};

use crate::dispatcher::{Dispatcher, OrderingPolicy};
use crate::error::StreamError;
use crate::usage::UsageContext;
use usenet_engine_task::{ChildTask, ShutdownHandle, ShutdownSignal};
use window::SegmentWindow;

/// Start offset and decoded size of one segment within the file.
#[derive(Debug, Clone, Copy)]
struct SegmentExtent {
    start: u64,
    size: u64,
}

enum Command {
    Read { want: usize, respond: oneshot::Sender<Result<Bytes, StreamError>> },
    Seek { offset: u64, respond: oneshot::Sender<Result<u64, StreamError>> },
}

/// Produces an ordered, seekable byte stream over `segment_ids`, fetching
/// with up to `concurrent_connections` workers and buffering at most
/// `buffer_size` segments ahead of the reader.
pub struct BufferedSegmentStreamer {
    commands: mpsc::Sender<Command>,
    file_size: u64,
    position: u64,
    _shutdown: ShutdownHandle,
    _workers: Vec<ChildTask<()>>,
    /// Secondary (straggler-triggered) fetch tasks, abort-on-drop like
    /// everything else here; grows over the stream's lifetime as stragglers
    /// are detected, so it lives behind a lock rather than being sized up front.
    _secondary_tasks: Arc<Mutex<Vec<ChildTask<()>>>>,
}

impl BufferedSegmentStreamer {
    /// Opens a stream. Performs the size-resolution algorithm (§4.7 step 1)
    /// before returning: if `segment_sizes` is not supplied, the first and
    /// last segments' headers are fetched to infer a uniform part size.
    #[instrument(skip(dispatcher, ctx, segment_sizes))]
    pub async fn open(
        dispatcher: Arc<Dispatcher>,
        segment_ids: Vec<String>,
        file_size: u64,
        concurrent_connections: usize,
        buffer_size: usize,
        segment_sizes: Option<Vec<u64>>,
        ctx: UsageContext,
    ) -> Result<Self, StreamError> {
        let extents = resolve_extents(&dispatcher, &segment_ids, file_size, segment_sizes, &ctx).await?;
        ctx.set_total_segments(segment_ids.len());
        ctx.set_buffer_window(buffer_size);

        let window = Arc::new(Mutex::new(SegmentWindow::new(segment_ids.len(), buffer_size)));
        let notify = Arc::new(Notify::new());
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        let segment_ids = Arc::new(segment_ids);
        let extents_arc = Arc::new(extents);
        let disable_degradation = ctx.disable_graceful_degradation();

        let mut workers = Vec::with_capacity(concurrent_connections);
        for worker_index in 0..concurrent_connections {
            let window = Arc::clone(&window);
            let notify = Arc::clone(&notify);
            let dispatcher = Arc::clone(&dispatcher);
            let segment_ids = Arc::clone(&segment_ids);
            let extents_arc = Arc::clone(&extents_arc);
            let ctx = ctx.clone();
            let shutdown_signal = shutdown_signal.clone();

            let task = tokio::spawn(
                fetch_loop(
                    worker_index,
                    window,
                    notify,
                    dispatcher,
                    segment_ids,
                    extents_arc,
                    ctx,
                    disable_degradation,
                    shutdown_signal,
                )
                .in_current_span(),
            );
            workers.push(ChildTask::from(task));
        }

        let secondary_tasks: Arc<Mutex<Vec<ChildTask<()>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let window = Arc::clone(&window);
            let notify = Arc::clone(&notify);
            let dispatcher = Arc::clone(&dispatcher);
            let segment_ids = Arc::clone(&segment_ids);
            let extents_arc = Arc::clone(&extents_arc);
            let secondary_tasks = Arc::clone(&secondary_tasks);
            let shutdown_signal = shutdown_signal.clone();
            workers.push(ChildTask::from(tokio::spawn(
                straggler_watch(
                    window,
                    notify,
                    dispatcher,
                    segment_ids,
                    extents_arc,
                    disable_degradation,
                    secondary_tasks,
                    shutdown_signal,
                )
                .in_current_span(),
            )));
        }

        let (command_tx, command_rx) = mpsc::channel(8);
        let extents_for_coordinator = Arc::clone(&extents_arc);
        workers.push(ChildTask::from(tokio::spawn(
            coordinator_loop(command_rx, window, notify, extents_for_coordinator, file_size, shutdown_signal)
                .in_current_span(),
        )));

        Ok(Self {
            commands: command_tx,
            file_size,
            position: 0,
            _shutdown: shutdown_handle,
            _workers: workers,
            _secondary_tasks: secondary_tasks,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub async fn read(&mut self, want: usize) -> Result<Bytes, StreamError> {
        if self.position >= self.file_size {
            return Ok(Bytes::new());
        }
        let (respond_tx, respond_rx) = oneshot::channel();
        self.commands
            .send(Command::Read { want, respond: respond_tx })
            .await
            .map_err(|_| StreamError::Canceled)?;
        let bytes = respond_rx.await.map_err(|_| StreamError::Canceled)??;
        self.position += bytes.len() as u64;
        Ok(bytes)
    }

    pub async fn seek(&mut self, offset: u64) -> Result<u64, StreamError> {
        if offset > self.file_size {
            return Err(StreamError::SeekOutOfRange { offset, file_size: self.file_size });
        }
        let (respond_tx, respond_rx) = oneshot::channel();
        self.commands
            .send(Command::Seek { offset, respond: respond_tx })
            .await
            .map_err(|_| StreamError::Canceled)?;
        let new_position = respond_rx.await.map_err(|_| StreamError::Canceled)??;
        self.position = new_position;
        Ok(new_position)
    }
}

/// Size-resolution algorithm: if `segment_sizes` is given, trust it
/// (recomputing the last entry against `file_size`); otherwise fetch the
/// first and last segment headers and assume uniform sizing in between
/// when they agree, falling back to a full per-segment HEAD pass otherwise.
async fn resolve_extents(
    dispatcher: &Dispatcher,
    segment_ids: &[String],
    file_size: u64,
    segment_sizes: Option<Vec<u64>>,
    ctx: &UsageContext,
) -> Result<Vec<SegmentExtent>, StreamError> {
    if segment_ids.is_empty() {
        return Ok(Vec::new());
    }

    if let Some(mut sizes) = segment_sizes {
        if let Some(last) = sizes.last_mut() {
            let sum_of_rest: u64 = sizes[..sizes.len() - 1].iter().sum();
            *last = file_size.saturating_sub(sum_of_rest);
        }
        return Ok(extents_from_sizes(&sizes));
    }

    let first_header = dispatcher.head(&segment_ids[0], ctx).await?;

    if segment_ids.len() == 1 {
        return Ok(vec![SegmentExtent { start: 0, size: file_size }]);
    }

    let second_header = dispatcher.head(&segment_ids[1], ctx).await?;
    let last_header = dispatcher.head(segment_ids.last().expect("non-empty"), ctx).await?;

    if second_header.part_size == first_header.part_size {
        let uniform = first_header.part_size;
        let mut sizes = vec![uniform; segment_ids.len()];
        *sizes.last_mut().expect("non-empty") = last_header.part_size.min(file_size);
        let sum_of_rest: u64 = sizes[..sizes.len() - 1].iter().sum();
        *sizes.last_mut().expect("non-empty") = file_size.saturating_sub(sum_of_rest);
        return Ok(extents_from_sizes(&sizes));
    }

    warn!("segment sizes are non-uniform, fetching every header");
    let mut sizes = Vec::with_capacity(segment_ids.len());
    sizes.push(first_header.part_size);
    sizes.push(second_header.part_size);
    for segment_id in &segment_ids[2..] {
        let header = dispatcher.head(segment_id, ctx).await?;
        sizes.push(header.part_size);
    }
    Ok(extents_from_sizes(&sizes))
}

fn extents_from_sizes(sizes: &[u64]) -> Vec<SegmentExtent> {
    let mut start = 0u64;
    let mut extents = Vec::with_capacity(sizes.len());
    for &size in sizes {
        extents.push(SegmentExtent { start, size });
        start += size;
    }
    extents
}

fn extent_index_for_offset(extents: &[SegmentExtent], offset: u64) -> usize {
    match extents.binary_search_by(|extent| extent.start.cmp(&offset)) {
        Ok(index) => index,
        Err(0) => 0,
        Err(index) => index - 1,
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_loop(
    worker_index: usize,
    window: Arc<Mutex<SegmentWindow>>,
    notify: Arc<Notify>,
    dispatcher: Arc<Dispatcher>,
    segment_ids: Arc<Vec<String>>,
    extents: Arc<Vec<SegmentExtent>>,
    ctx: UsageContext,
    disable_degradation: bool,
    shutdown: ShutdownSignal,
) {
    loop {
        let worker_ctx = ctx.clone();
        worker_ctx.set_buffered_count(worker_index);

        let seq = {
            let mut guard = window.lock();
            let next = guard.next_unscheduled();
            if let Some(seq) = next {
                // The context recorded here is the same `Arc<Inner>` used for
                // the fetch below, so a straggler watcher reading it back out
                // of the window sees `current_provider_index` update live.
                guard.mark_in_flight(seq, worker_ctx.clone());
            }
            next
        };

        let seq = match seq {
            Some(seq) => seq,
            None => {
                tokio::select! {
                    () = notify.notified() => continue,
                    () = shutdown.clone().wait() => return,
                }
            }
        };

        if seq >= segment_ids.len() {
            continue;
        }

        let segment_id = segment_ids[seq].clone();

        let result = dispatcher.body(&segment_id, &worker_ctx, OrderingPolicy::Balanced).await;
        let mut guard = window.lock();
        if guard.is_settled(seq) {
            // A secondary/straggler fetch already completed this slot.
            drop(guard);
            notify.notify_waiters();
            continue;
        }
        match result {
            Ok(body) => guard.mark_ready(seq, body.bytes),
            Err(err) if disable_degradation => {
                warn!(seq, error = %err, "segment permanently failed, graceful degradation disabled");
                guard.mark_failed(seq, err.to_string());
            }
            Err(err) => {
                warn!(seq, error = %err, "segment permanently failed, filling with zeros");
                let size = extents.get(seq).map(|extent| extent.size).unwrap_or(0);
                guard.mark_zero_filled(seq, size);
            }
        }
        drop(guard);
        notify.notify_waiters();
    }
}

/// Periodically scans the window for in-flight fetches past the straggler
/// deadline and launches a secondary fetch excluding the slow provider.
/// First writer to settle the slot wins; `fetch_loop`'s primary attempt and
/// the secondary fetch spawned here both check
/// [`SegmentWindow::is_settled`] before writing.
#[allow(clippy::too_many_arguments)]
async fn straggler_watch(
    window: Arc<Mutex<SegmentWindow>>,
    notify: Arc<Notify>,
    dispatcher: Arc<Dispatcher>,
    segment_ids: Arc<Vec<String>>,
    extents: Arc<Vec<SegmentExtent>>,
    disable_degradation: bool,
    secondary_tasks: Arc<Mutex<Vec<ChildTask<()>>>>,
    shutdown: ShutdownSignal,
) {
    let mut launched: HashSet<usize> = HashSet::new();
    loop {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(250)) => {}
            () = shutdown.clone().wait() => return,
        }

        let stragglers = window.lock().stragglers();
        launched.retain(|&seq| window.lock().is_in_flight(seq));

        for (seq, ctx) in stragglers {
            if seq >= segment_ids.len() || !launched.insert(seq) {
                continue;
            }
            let Some(provider_index) = ctx.current_provider_index() else { continue };

            warn!(seq, provider_index, "segment fetch straggling, launching secondary fetch");
            let key = ctx.affinity_key().map(str::to_owned).unwrap_or_else(|| segment_ids[seq].clone());
            dispatcher.penalize_straggler(&key, provider_index);

            let secondary_ctx = ctx.fork_secondary(provider_index);
            let segment_id = segment_ids[seq].clone();
            let window = Arc::clone(&window);
            let notify = Arc::clone(&notify);
            let dispatcher = Arc::clone(&dispatcher);
            let extents = Arc::clone(&extents);

            let task = ChildTask::spawn(async move {
                let result = dispatcher.body(&segment_id, &secondary_ctx, OrderingPolicy::Balanced).await;
                let mut guard = window.lock();
                if guard.is_settled(seq) {
                    drop(guard);
                    notify.notify_waiters();
                    return;
                }
                match result {
                    Ok(body) => guard.mark_ready(seq, body.bytes),
                    Err(err) if disable_degradation => guard.mark_failed(seq, err.to_string()),
                    Err(_) => {
                        let size = extents.get(seq).map(|extent| extent.size).unwrap_or(0);
                        guard.mark_zero_filled(seq, size);
                    }
                }
                drop(guard);
                notify.notify_waiters();
            });
            secondary_tasks.lock().push(task);
        }
    }
}

async fn coordinator_loop(
    mut commands: mpsc::Receiver<Command>,
    window: Arc<Mutex<SegmentWindow>>,
    notify: Arc<Notify>,
    extents: Arc<Vec<SegmentExtent>>,
    file_size: u64,
    shutdown: ShutdownSignal,
) {
    let mut current_seq = 0usize;
    let mut current_bytes: Option<Bytes> = None;
    let mut in_segment_offset: usize = 0;
    let buffer_size = {
        let guard = window.lock();
        guard.window_end() - guard.window_start()
    };

    loop {
        let command = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => return,
            },
            () = shutdown.clone().wait() => return,
        };

        match command {
            Command::Read { want, respond } => {
                let result = read_next(
                    &window,
                    &notify,
                    &mut current_seq,
                    &mut current_bytes,
                    &mut in_segment_offset,
                    want,
                    buffer_size,
                )
                .await;
                let _ = respond.send(result);
            }
            Command::Seek { offset, respond } => {
                let target_seq = extent_index_for_offset(&extents, offset);
                let in_segment = extents
                    .get(target_seq)
                    .map(|extent| offset.saturating_sub(extent.start) as usize)
                    .unwrap_or(0);

                {
                    let mut guard = window.lock();
                    guard.slide_to(target_seq, buffer_size);
                }
                current_seq = target_seq;
                current_bytes = None;
                in_segment_offset = in_segment;
                notify.notify_waiters();

                let _ = respond.send(Ok(offset.min(file_size)));
            }
        }
    }
}

async fn read_next(
    window: &Arc<Mutex<SegmentWindow>>,
    notify: &Arc<Notify>,
    current_seq: &mut usize,
    current_bytes: &mut Option<Bytes>,
    in_segment_offset: &mut usize,
    want: usize,
    buffer_size: usize,
) -> Result<Bytes, StreamError> {
    loop {
        if let Some(bytes) = current_bytes {
            let remaining = &bytes[*in_segment_offset..];
            if !remaining.is_empty() {
                let take = remaining.len().min(want);
                let mut out = BytesMut::with_capacity(take);
                out.extend_from_slice(&remaining[..take]);
                *in_segment_offset += take;
                return Ok(out.freeze());
            }
            // Fully consumed: advance the window.
            *current_bytes = None;
            *current_seq += 1;
            *in_segment_offset = 0;
            let mut guard = window.lock();
            guard.slide_to(*current_seq, buffer_size);
            drop(guard);
            notify.notify_waiters();
        }

        let settled = {
            let mut guard = window.lock();
            guard.take_settled(*current_seq)
        };

        match settled {
            Some(Ok(bytes)) => *current_bytes = Some(bytes),
            Some(Err(err)) => return Err(err),
            None => notify.notified().await,
        }
    }
}
