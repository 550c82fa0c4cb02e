//! Transport for the Ocarina USB-CAN adapter (spec §4.B): an ASCII
//! command/event protocol over a USB-serial VCOM port. A background
//! thread decodes the event stream and forwards it to async callers
//! through a bounded channel; commands are written synchronously on the
//! calling thread, the way the reference adapter's API does it.

mod protocol;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;

pub use protocol::{Bitrate, BusState, CanError, Event, ErrorFlag};
use protocol::{Cmd, SYNC_FRAME};
pub use propcan::{Error, Frame, Transport};

/// Bound on the event channel between the reader thread and async
/// consumers. Once full, the newest event is dropped and a warning is
/// logged — preferable to unbounded growth if a consumer stalls, and to
/// blocking the reader thread (which would stall heartbeat detection).
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Low-level handle to an Ocarina adapter: issues commands and decodes
/// its event stream. Most callers want [`OcarinaTransport`] instead,
/// which adapts this to [`propcan::Transport`].
pub struct Ocarina {
    writer: Box<dyn serialport::SerialPort>,
    events: mpsc::Receiver<Event>,
    stop: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
}

impl Ocarina {
    /// Open `path`, reset the adapter, and wait for its sync frame before
    /// returning. Baud rate is irrelevant over USB CDC-ACM but is still
    /// required by the `serialport` API.
    pub fn open(path: &str) -> Result<Self, Error> {
        let mut port = serialport::new(path, 115_200)
            .timeout(Duration::from_secs(2))
            .open()
            .map_err(|e| Error::Transport(format!("failed to open {path}: {e}")))?;

        write_command(port.as_mut(), Cmd::Nop, &[])?;
        write_command(port.as_mut(), Cmd::Reset, &[])?;
        wait_for_sync(port.as_mut())?;
        info!("ocarina on {path} synchronized");

        let reader_port = port
            .try_clone()
            .map_err(|e| Error::Transport(format!("failed to clone serial handle: {e}")))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let reader_thread = std::thread::Builder::new()
            .name("ocarina-event-reader".into())
            .spawn({
                let stop = stop.clone();
                move || event_reader_loop(reader_port, tx, stop)
            })
            .map_err(|e| Error::Transport(format!("failed to spawn reader thread: {e}")))?;

        Ok(Ocarina {
            writer: port,
            events: rx,
            stop,
            reader_thread: Some(reader_thread),
        })
    }

    fn write_command(&mut self, cmd: Cmd, data: &[u8]) -> Result<(), Error> {
        write_command(self.writer.as_mut(), cmd, data)
    }

    pub fn set_bitrate_auto(&mut self) -> Result<(), Error> {
        self.write_command(Cmd::AutoBitrate, &[])
    }

    pub fn set_bitrate_manual(&mut self, bitrate: Bitrate) -> Result<(), Error> {
        self.write_command(Cmd::SetBitrate, &[bitrate as u8])
    }

    pub fn set_silent(&mut self, enable: bool) -> Result<(), Error> {
        self.write_command(if enable { Cmd::SilentEnable } else { Cmd::SilentDisable }, &[])
    }

    pub fn set_loopback(&mut self, enable: bool) -> Result<(), Error> {
        self.write_command(if enable { Cmd::LoopbackEnable } else { Cmd::LoopbackDisable }, &[])
    }

    pub fn set_message_forwarding(&mut self, enable: bool) -> Result<(), Error> {
        self.write_command(
            if enable {
                Cmd::RxForwardingEnable
            } else {
                Cmd::RxForwardingDisable
            },
            &[],
        )
    }

    pub fn query_error_flags(&mut self) -> Result<(), Error> {
        self.write_command(Cmd::QueryErrorFlags, &[])
    }

    pub fn query_config(&mut self) -> Result<(), Error> {
        self.write_command(Cmd::QueryConfig, &[])
    }

    pub fn query_interface_id(&mut self) -> Result<(), Error> {
        self.write_command(Cmd::QueryInterfaceId, &[])
    }

    pub fn query_version(&mut self) -> Result<(), Error> {
        self.write_command(Cmd::QueryVersion, &[])
    }

    pub fn query_counters(&mut self) -> Result<(), Error> {
        self.write_command(Cmd::QueryCounters, &[])
    }

    pub fn reset_counters(&mut self) -> Result<(), Error> {
        self.write_command(Cmd::ResetCounters, &[])
    }

    pub fn send_message_std(&mut self, sid: u16, data: &[u8]) -> Result<(), Error> {
        if sid >= 1 << 11 {
            return Err(Error::Protocol(format!("std id {sid:#x} exceeds 11 bits")));
        }
        if data.len() > 8 {
            return Err(Error::Protocol("CAN payload longer than 8 bytes".into()));
        }
        let mut payload = sid.to_le_bytes().to_vec();
        payload.extend_from_slice(data);
        self.write_command(Cmd::SendMessageStdId, &payload)
    }

    pub fn send_message_ext(&mut self, eid: u32, data: &[u8]) -> Result<(), Error> {
        if eid >= 1 << 29 {
            return Err(Error::Protocol(format!("ext id {eid:#x} exceeds 29 bits")));
        }
        if data.len() > 8 {
            return Err(Error::Protocol("CAN payload longer than 8 bytes".into()));
        }
        let mut payload = eid.to_le_bytes().to_vec();
        payload.extend_from_slice(data);
        self.write_command(Cmd::SendMessageExtId, &payload)
    }

    /// Receive the next decoded event, waiting until `deadline` (if any).
    pub async fn read_event(&mut self, deadline: Option<Instant>) -> Result<Event, Error> {
        match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::timeout(remaining, self.events.recv())
                    .await
                    .map_err(|_| Error::Timeout)?
                    .ok_or_else(|| Error::Transport("ocarina reader thread exited".into()))
            }
            None => self
                .events
                .recv()
                .await
                .ok_or_else(|| Error::Transport("ocarina reader thread exited".into())),
        }
    }

    /// Disable message forwarding and stop the reader thread. Safe to call
    /// more than once; subsequent calls are no-ops.
    pub fn close(&mut self) {
        if self.reader_thread.is_none() {
            return;
        }
        let _ = self.set_message_forwarding(false);
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ocarina {
    fn drop(&mut self) {
        if self.reader_thread.is_some() {
            debug!("dropping ocarina handle without explicit close(), disabling forwarding best-effort");
            let _ = self.set_message_forwarding(false);
            self.stop.store(true, Ordering::SeqCst);
        }
    }
}

fn command_frame(cmd: Cmd, data: &[u8]) -> Result<Vec<u8>, Error> {
    if data.len() > u8::MAX as usize {
        return Err(Error::Protocol("command payload too long".into()));
    }
    let mut frame = Vec::with_capacity(2 + data.len());
    frame.push(cmd as u8);
    frame.push(data.len() as u8);
    frame.extend_from_slice(data);
    Ok(frame)
}

fn write_command(port: &mut dyn serialport::SerialPort, cmd: Cmd, data: &[u8]) -> Result<(), Error> {
    let frame = command_frame(cmd, data)?;
    port.write_all(&frame)
        .map_err(|e| Error::Transport(format!("serial write failed: {e}")))
}

/// Read one byte at a time until the trailing window of bytes read
/// matches [`SYNC_FRAME`], discarding everything before it.
fn wait_for_sync(port: &mut dyn serialport::SerialPort) -> Result<(), Error> {
    let mut window = Vec::with_capacity(SYNC_FRAME.len());
    let mut byte = [0u8; 1];
    loop {
        port.read_exact(&mut byte)
            .map_err(|e| Error::Transport(format!("serial read failed while syncing: {e}")))?;
        window.push(byte[0]);
        if window.len() > SYNC_FRAME.len() {
            window.remove(0);
        }
        if window == SYNC_FRAME {
            return Ok(());
        }
    }
}

/// Runs on a dedicated thread: blocking-reads `opcode ‖ length ‖ payload`
/// frames and forwards decoded events until told to stop or the port
/// errors out.
fn event_reader_loop(
    mut port: Box<dyn serialport::SerialPort>,
    events: mpsc::Sender<Event>,
    stop: Arc<AtomicBool>,
) {
    let _ = port.set_timeout(Duration::from_millis(250));
    let mut opcode = [0u8; 1];
    let mut length = [0u8; 1];

    while !stop.load(Ordering::Relaxed) {
        match port.read_exact(&mut opcode) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("ocarina reader thread exiting: {e}");
                return;
            }
        }

        if let Err(e) = port.read_exact(&mut length) {
            warn!("ocarina reader thread exiting mid-frame: {e}");
            return;
        }
        let mut payload = vec![0u8; length[0] as usize];
        if let Err(e) = port.read_exact(&mut payload) {
            warn!("ocarina reader thread exiting mid-frame: {e}");
            return;
        }

        match protocol::decode_event(opcode[0], &payload) {
            Ok(event) => {
                if events.try_send(event).is_err() {
                    warn!("ocarina event channel full, dropping event");
                }
            }
            Err(e) => warn!("discarding unparseable ocarina event: {e}"),
        }
    }
}

/// Adapts [`Ocarina`] to [`propcan::Transport`]: on construction it puts
/// the adapter into a known, conservative configuration (auto bitrate,
/// not silent, no loopback, forwarding enabled), matching the reference
/// adapter's bring-up sequence.
pub struct OcarinaTransport {
    ocarina: Ocarina,
}

impl OcarinaTransport {
    pub fn open(path: &str) -> Result<Self, Error> {
        let mut ocarina = Ocarina::open(path)?;
        ocarina.set_bitrate_auto()?;
        ocarina.set_silent(false)?;
        ocarina.set_loopback(false)?;
        ocarina.set_message_forwarding(true)?;
        Ok(OcarinaTransport { ocarina })
    }

    pub fn close(&mut self) {
        self.ocarina.close();
    }
}

#[async_trait]
impl Transport for OcarinaTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), Error> {
        self.ocarina.send_message_ext(frame.id(), frame.data())
    }

    async fn receive(&mut self, deadline: Option<Instant>) -> Result<Frame, Error> {
        loop {
            match self.ocarina.read_event(deadline).await? {
                Event::CanMessage { id, extended: true, data, .. } => return Ok(Frame::new(id, data)),
                Event::CanMessage { extended: false, .. } => {
                    debug!("ignoring standard-id CAN message, bus protocol uses extended ids only");
                }
                other => debug!("ignoring non-CAN ocarina event: {other:?}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_layout() {
        let frame = command_frame(Cmd::SendMessageExtId, &[0xDE, 0xAD]).unwrap();
        assert_eq!(frame, vec![b'M', 2, 0xDE, 0xAD]);
    }

    #[test]
    fn command_frame_rejects_oversized_payload() {
        let data = vec![0u8; 256];
        assert!(command_frame(Cmd::SendMessageExtId, &data).is_err());
    }
}
