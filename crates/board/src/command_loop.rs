//! Foreground Command Loop
//!
//! Frames are postcard-encoded [`Command`]s and [`Response`]s, COBS-stuffed
//! and terminated by a zero byte.

use crate::board::Board;
use crate::command::{Command, Response};
use crate::error::BoardResult;
use postcard::accumulator::{CobsAccumulator, FeedResult};
use serde::Serialize;
use shuttle_protocol::{BridgeError, BridgeResult, CommInterface, Transport};
use tracing::{debug, warn};

/// Largest command frame accepted from the host
pub const MAX_COMMAND_FRAME: usize = 1024;

/// Encode a message as one zero-terminated COBS frame
pub fn encode_frame<T: Serialize>(message: &T) -> BoardResult<Vec<u8>> {
    Ok(postcard::to_allocvec_cobs(message)?)
}

/// Serves host commands over a transport
///
/// [`CommandLoop::poll`] never waits for input, so it can run on the same
/// foreground cadence as the rest of the board.
pub struct CommandLoop<T: Transport> {
    transport: T,
    interface: CommInterface,
    frames: CobsAccumulator<MAX_COMMAND_FRAME>,
    scratch: Vec<u8>,
    handled: u64,
}

impl<T: Transport> CommandLoop<T> {
    pub fn new(transport: T, interface: CommInterface) -> Self {
        Self {
            transport,
            interface,
            frames: CobsAccumulator::new(),
            scratch: vec![0u8; MAX_COMMAND_FRAME],
            handled: 0,
        }
    }

    /// Open the host interface
    pub fn open(&mut self) -> BridgeResult<()> {
        self.transport.open(self.interface)
    }

    /// Close the host interface, discarding any partial frame
    pub fn close(&mut self) -> BridgeResult<()> {
        self.frames = CobsAccumulator::new();
        self.transport.close(self.interface)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Commands executed since creation
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Execute every complete frame already received
    ///
    /// Returns the number of frames answered, including malformed ones.
    pub fn poll(&mut self, board: &Board) -> BridgeResult<usize> {
        let intf = self.interface;
        let mut answered = 0;

        loop {
            if self.transport.available(intf) == 0 {
                break;
            }
            let count = self.transport.read(intf, &mut self.scratch)?;
            if count == 0 {
                break;
            }

            let mut window = &self.scratch[..count];
            while !window.is_empty() {
                window = match self.frames.feed::<Command>(window) {
                    FeedResult::Consumed => break,
                    FeedResult::OverFull(remaining) => {
                        warn!("Dropped a frame longer than {} bytes", MAX_COMMAND_FRAME);
                        let error = BridgeError::WrongResponse("frame too long".to_string());
                        send(&mut self.transport, intf, &Response::error(&error))?;
                        answered += 1;
                        remaining
                    }
                    FeedResult::DeserError(remaining) => {
                        warn!("Dropped a frame that is not a command");
                        let error = BridgeError::WrongResponse("malformed command frame".to_string());
                        send(&mut self.transport, intf, &Response::error(&error))?;
                        answered += 1;
                        remaining
                    }
                    FeedResult::Success { data, remaining } => {
                        let response = board.execute(data);
                        send(&mut self.transport, intf, &response)?;
                        self.handled += 1;
                        answered += 1;
                        remaining
                    }
                };
            }
        }

        if answered > 0 {
            self.transport.flush(intf)?;
            debug!("Answered {} frame(s)", answered);
        }
        Ok(answered)
    }
}

fn send<T: Transport>(transport: &mut T, intf: CommInterface, response: &Response) -> BridgeResult<()> {
    let frame = encode_frame(response).map_err(|e| BridgeError::CommIo(e.to_string()))?;
    transport.write(intf, &frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardConfig;
    use crate::transport::MemoryTransport;
    use bus_manager::{MockBus, SensorTarget};
    use shuttle_protocol::{ErrorCode, I2cBus, I2cMode};

    const VCOM: CommInterface = CommInterface::Vcom;

    fn setup() -> (Board, CommandLoop<MemoryTransport>, MemoryTransport) {
        let mock = MockBus::new();
        mock.set_registers(SensorTarget::I2c { bus: I2cBus::Bus1, address: 0x76 }, 0xD0, &[0x60]);
        let board = Board::new(BoardConfig::default(), Box::new(mock)).unwrap();

        let (device, mut host) = MemoryTransport::pair();
        let mut commands = CommandLoop::new(device, VCOM);
        commands.open().unwrap();
        host.open(VCOM).unwrap();
        (board, commands, host)
    }

    fn send_raw(host: &mut MemoryTransport, bytes: &[u8]) {
        host.write(VCOM, bytes).unwrap();
        host.flush(VCOM).unwrap();
    }

    fn replies(host: &mut MemoryTransport) -> Vec<Response> {
        let mut bytes = vec![0u8; host.available(VCOM)];
        let count = host.read(VCOM, &mut bytes).unwrap();
        bytes.truncate(count);
        bytes
            .split_inclusive(|&b| b == 0)
            .map(|frame| postcard::from_bytes_cobs(&mut frame.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_idle_poll_returns_immediately() {
        let (board, mut commands, _host) = setup();
        assert_eq!(commands.poll(&board).unwrap(), 0);
    }

    #[test]
    fn test_executes_pipelined_frames() {
        let (board, mut commands, mut host) = setup();
        let mut bytes = encode_frame(&Command::ConfigI2cBus { bus: I2cBus::Bus1, mode: I2cMode::Standard }).unwrap();
        bytes.extend(
            encode_frame(&Command::ReadRegisters {
                target: SensorTarget::I2c { bus: I2cBus::Bus1, address: 0x76 },
                register: 0xD0,
                len: 1,
            })
            .unwrap(),
        );
        send_raw(&mut host, &bytes);

        assert_eq!(commands.poll(&board).unwrap(), 2);
        assert_eq!(replies(&mut host), vec![Response::Done, Response::Registers(vec![0x60])]);
        assert_eq!(commands.handled(), 2);
    }

    #[test]
    fn test_frame_split_across_polls() {
        let (board, mut commands, mut host) = setup();
        let frame = encode_frame(&Command::GetMillis).unwrap();
        let (head, tail) = frame.split_at(frame.len() / 2);

        send_raw(&mut host, head);
        assert_eq!(commands.poll(&board).unwrap(), 0);
        send_raw(&mut host, tail);
        assert_eq!(commands.poll(&board).unwrap(), 1);
        assert!(matches!(replies(&mut host)[..], [Response::Millis(_)]));
    }

    #[test]
    fn test_malformed_frame_answers_wrong_response() {
        let (board, mut commands, mut host) = setup();
        let mut bytes = vec![0x05, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];
        bytes.extend(encode_frame(&Command::GetMicros).unwrap());
        send_raw(&mut host, &bytes);

        assert_eq!(commands.poll(&board).unwrap(), 2);
        let replies = replies(&mut host);
        assert_eq!(replies[0].status(), ErrorCode::CommWrongResponse.as_i16());
        // The loop recovers on the next frame boundary
        assert!(matches!(replies[1], Response::Micros(_)));
        assert_eq!(commands.handled(), 1);
    }
}
