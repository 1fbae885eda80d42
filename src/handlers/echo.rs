use crate::bsp::{Channel, Handler, HandlerKind, Mark, ReadOutcome, WorkerContext};
use crate::error::Error;
use std::sync::Arc;
use tracing::debug;

/// Registration entry for [`LineEchoHandler`].
pub const LINE_ECHO: HandlerKind = HandlerKind::new("line-echo", LineEchoHandler::construct);

/// Terminal-style echo service.
///
/// Collects bytes up to a carriage return and answers `You sent: <line>`.
/// Terminal parameter marks have their parameter byte consumed; a timing
/// request is answered with an acknowledged timing reply.
pub struct LineEchoHandler {
    channel: Arc<Channel>,
    line: Vec<u8>,
}

impl LineEchoHandler {
    pub fn construct(channel: Arc<Channel>) -> Box<dyn Handler> {
        Box::new(Self {
            channel,
            line: Vec::new(),
        })
    }

    fn on_byte(&mut self, byte: u8) -> Result<(), Error> {
        self.line.push(byte);
        if byte == b'\r' {
            let mut reply = b"You sent: ".to_vec();
            reply.append(&mut self.line);
            debug!(socket = self.channel.socket_id(), len = reply.len(), "Echoing line");
            self.channel.write(&reply)?;
        }
        Ok(())
    }

    fn on_mark(&mut self, mark: Mark) -> Result<(), Error> {
        let socket = self.channel.socket_id();
        match mark {
            mark if mark.has_parameter() => {
                let value = self.channel.read_byte()?;
                debug!(socket, %mark, value, "Terminal parameter");
            }
            Mark::TimingRequest => {
                debug!(socket, "Timing request, replying");
                self.channel.send_mark(Mark::TimingReply, true)?;
            }
            Mark::Other(code) => debug!(socket, code, "Unexpected mark"),
            _ => debug!(socket, %mark, "Got mark"),
        }
        Ok(())
    }
}

impl Handler for LineEchoHandler {
    fn run(&mut self, _ctx: &WorkerContext) -> Result<(), Error> {
        let mut buf = [0u8; 64];
        loop {
            match self.channel.read(&mut buf)? {
                ReadOutcome::Data(n) => {
                    for &byte in &buf[..n] {
                        self.on_byte(byte)?;
                    }
                }
                ReadOutcome::Mark(mark) => self.on_mark(mark)?,
            }
        }
    }
}
