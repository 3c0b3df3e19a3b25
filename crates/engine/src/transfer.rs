//! Transfer job management for remote (non-stream) tracks.
//!
//! The coordinator sits between the network transfer subsystem and the
//! [`StreamBuffer`]: data callbacks run on the delivery thread and feed the
//! buffer, backpressure suspends the job near capacity, and room signals from
//! the pipeline source resume it. At most one job exists per loaded track;
//! it is destroyed on completion, cancellation, or a new load.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use crate::buffer::StreamBuffer;
use crate::messages::EngineMessage;

/// Bytes per read from the transfer body.
const TRANSFER_BLOCK_SIZE: usize = 32 * 1024;

/// Poll interval while a job is suspended or waiting to be cancelled.
const SUSPEND_POLL: Duration = Duration::from_millis(20);

/// Handle to an in-flight data fetch.
///
/// `suspend`/`resume` are flow control, not thread blocking: a suspended job
/// stops delivering data but stays alive. `cancel` ends it for good.
pub trait TransferJob: Send {
    fn suspend(&mut self);
    fn resume(&mut self);
    fn cancel(&mut self);
}

/// The network transfer subsystem: starts one job per URL and delivers data
/// through the coordinator's callbacks.
pub trait TransferBackend: Send {
    fn start(&self, url: &str, coordinator: Arc<TransferCoordinator>) -> Result<Box<dyn TransferJob>>;
}

/// Coordinates one transfer job feeding one stream buffer.
///
/// `on_data` runs on the delivery thread; `on_room`, `cancel` run on the
/// engine's control context. The suspended flag makes each high/low-water
/// crossing act exactly once.
pub struct TransferCoordinator {
    buffer: Arc<StreamBuffer>,
    messages: Sender<EngineMessage>,
    generation: u64,
    suspended: AtomicBool,
    job: Mutex<Option<Box<dyn TransferJob>>>,
}

impl TransferCoordinator {
    pub fn new(
        buffer: Arc<StreamBuffer>,
        generation: u64,
        messages: Sender<EngineMessage>,
    ) -> Self {
        Self {
            buffer,
            messages,
            generation,
            suspended: AtomicBool::new(false),
            job: Mutex::new(None),
        }
    }

    /// Hand the started job to the coordinator. Called once, right after
    /// [`TransferBackend::start`] returns.
    pub fn attach(&self, job: Box<dyn TransferJob>) {
        *self.job.lock().unwrap() = Some(job);
    }

    /// Delivery-thread callback: feed the buffer, report prebuffer progress,
    /// suspend the job when the fill crosses the high-water mark.
    pub fn on_data(&self, chunk: &[u8]) {
        let fill = self.buffer.push(chunk);

        let prebuffer = self.buffer.low_water().max(1);
        let percent = (fill * 100 / prebuffer) as u32;
        if percent <= 100 {
            let _ = self.messages.send(EngineMessage::Buffering {
                generation: self.generation,
                percent,
            });
        }

        if fill >= self.buffer.high_water() && !self.suspended.swap(true, Ordering::SeqCst) {
            tracing::debug!(fill, "suspending transfer job");
            if let Some(job) = self.job.lock().unwrap().as_mut() {
                job.suspend();
            }
        }
    }

    /// Control-context callback for a source room signal: resume the job if it
    /// was suspended and the fill has dropped below the low-water mark.
    pub fn on_room(&self) {
        if !self.suspended.load(Ordering::SeqCst) {
            return;
        }
        let fill = self.buffer.fill();
        if fill < self.buffer.low_water() {
            self.suspended.store(false, Ordering::SeqCst);
            tracing::debug!(fill, "resuming transfer job");
            if let Some(job) = self.job.lock().unwrap().as_mut() {
                job.resume();
            }
        }
    }

    /// Delivery-thread callback: all data arrived. The buffer drains out and
    /// then ends; the engine releases the job when the message arrives.
    pub fn on_finished(&self) {
        self.buffer.signal_end();
        let _ = self.messages.send(EngineMessage::TransferFinished {
            generation: self.generation,
        });
    }

    /// Delivery-thread callback: the transfer failed. No automatic retry.
    pub fn on_error(&self, message: String) {
        self.buffer.signal_end();
        let _ = self.messages.send(EngineMessage::TransferFailed {
            generation: self.generation,
            message,
        });
    }

    /// Cancel and release the job, if any. Idempotent.
    pub fn cancel(&self) {
        if let Some(mut job) = self.job.lock().unwrap().take() {
            job.cancel();
        }
    }
}

/// HTTP transfer backend built on ureq.
///
/// The body is streamed in blocks on a worker thread; suspend parks the
/// thread between reads without dropping the connection.
pub struct HttpTransfer;

struct HttpControl {
    suspended: AtomicBool,
    cancelled: AtomicBool,
}

struct HttpTransferJob {
    control: Arc<HttpControl>,
}

impl TransferJob for HttpTransferJob {
    fn suspend(&mut self) {
        self.control.suspended.store(true, Ordering::SeqCst);
    }

    fn resume(&mut self) {
        self.control.suspended.store(false, Ordering::SeqCst);
    }

    fn cancel(&mut self) {
        self.control.cancelled.store(true, Ordering::SeqCst);
    }
}

impl TransferBackend for HttpTransfer {
    fn start(&self, url: &str, coordinator: Arc<TransferCoordinator>) -> Result<Box<dyn TransferJob>> {
        let control = Arc::new(HttpControl {
            suspended: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });

        let url = url.to_string();
        let thread_control = control.clone();
        std::thread::Builder::new()
            .name("transfer-http".into())
            .spawn(move || {
                if let Err(e) = fetch_body(&url, &thread_control, &coordinator) {
                    tracing::warn!(url = %url, "transfer failed: {e:#}");
                    coordinator.on_error(format!("{e:#}"));
                }
            })
            .context("spawn transfer thread")?;

        Ok(Box::new(HttpTransferJob { control }))
    }
}

/// Stream the response body block by block, honoring suspend and cancel.
fn fetch_body(url: &str, control: &HttpControl, coordinator: &TransferCoordinator) -> Result<()> {
    let resp = ureq::get(url)
        .call()
        .with_context(|| format!("GET {url}"))?;
    let (_, body) = resp.into_parts();
    let mut reader = body.into_reader();

    let mut block = vec![0u8; TRANSFER_BLOCK_SIZE];
    loop {
        while control.suspended.load(Ordering::SeqCst) {
            if control.cancelled.load(Ordering::SeqCst) {
                return Ok(());
            }
            std::thread::sleep(SUSPEND_POLL);
        }
        if control.cancelled.load(Ordering::SeqCst) {
            return Ok(());
        }

        match reader.read(&mut block) {
            Ok(0) => {
                coordinator.on_finished();
                return Ok(());
            }
            Ok(n) => coordinator.on_data(&block[..n]),
            Err(e) => return Err(e).context("read transfer body"),
        }
    }
}
