/// The message pump owns the byte transport and runs the background read
/// worker: read a chunk, accumulate, drain complete frames into a bounded
/// queue in wire arrival order. Writes go straight through `send` from the
/// calling thread; the two directions never contend.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use log::{debug, error, trace, warn};

use crate::error::{DecodeError, TransportError};
use crate::message::{self, Message};
use crate::transport::Transport;

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const READ_CHUNK_SIZE: usize = 512;
const QUEUE_CAPACITY: usize = 256;
const PUSH_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

pub struct Pump {
    transport: Arc<dyn Transport>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Pump {
    /// Start the read worker over `transport`. Decoded frames arrive on
    /// the returned receiver in wire order.
    pub fn new(transport: Box<dyn Transport>) -> (Pump, Receiver<Message>) {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let running = Arc::new(AtomicBool::new(true));
        let (frames_tx, frames_rx) = bounded(QUEUE_CAPACITY);
        let worker = {
            let transport = transport.clone();
            let running = running.clone();
            thread::spawn(move || read_loop(&*transport, &running, frames_tx))
        };
        (
            Pump {
                transport,
                running,
                worker: Mutex::new(Some(worker)),
            },
            frames_rx,
        )
    }

    /// Encode and write one message. Safe to call from any thread while
    /// the worker reads.
    pub fn send(&self, mesg: &Message) -> Result<(), TransportError> {
        trace!("Sending frame: {:?}", mesg);
        self.transport.write(&mesg.encode()).map(|_| ())
    }

    /// Stop the worker and close the transport. Once this returns no
    /// further frames are queued. Idempotent.
    pub fn stop(&self) -> Result<(), TransportError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            // The loop re-checks the flag at least once per read timeout.
            if worker.join().is_err() {
                error!("Pump read worker panicked");
            }
        }
        self.transport.close()
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Error closing transport: {}", e);
        }
    }
}

fn read_loop(transport: &dyn Transport, running: &AtomicBool, frames: Sender<Message>) {
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK_SIZE * 2);
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut consecutive_errors = 0u32;
    while running.load(Ordering::SeqCst) {
        match transport.read(&mut chunk, READ_TIMEOUT) {
            Ok(0) => continue,
            Ok(n) => {
                consecutive_errors = 0;
                buffer.extend_from_slice(&chunk[..n]);
                if !drain_frames(&mut buffer, &frames) {
                    break;
                }
            }
            // An idle bus reads as a timeout; just poll again.
            Err(TransportError::Timeout) => consecutive_errors = 0,
            Err(TransportError::DeviceClosed) => {
                debug!("Transport closed, stopping read worker");
                break;
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    error!("Read failing repeatedly, stopping read worker: {}", e);
                    break;
                }
                debug!("Transient read error: {}", e);
                thread::sleep(READ_TIMEOUT);
            }
        }
    }
    debug!("Read worker exited");
}

/// Decode every complete frame at the front of `buffer` and queue it.
/// Returns false once the queue's receiver is gone.
fn drain_frames(buffer: &mut Vec<u8>, frames: &Sender<Message>) -> bool {
    loop {
        match message::decode(buffer) {
            Ok((mesg, consumed)) => {
                buffer.drain(..consumed);
                trace!("Queueing frame: {:?}", mesg);
                match frames.send_timeout(mesg, PUSH_TIMEOUT) {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(mesg)) => {
                        warn!("Frame queue full, dropping {:?}", mesg);
                    }
                    Err(SendTimeoutError::Disconnected(_)) => return false,
                }
            }
            Err(DecodeError::NeedMoreData) => return true,
            Err(DecodeError::Checksum { skip }) | Err(DecodeError::Malformed { skip }) => {
                debug!("Resyncing read stream, discarding {} bytes", skip);
                buffer.drain(..skip);
            }
        }
    }
}
