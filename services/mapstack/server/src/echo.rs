//! Echo server

use crate::simple::SimpleServer;
use mapstack_wire::{MapPacket, PacketId, PacketPool, PacketSink, Process, SharedSink, Status};
use tracing::{debug, warn};

/// Replies to each packet's sender with the packet's innermost payload.
///
/// Trailing checksums are not part of the payload.
///
/// Inbound packets must already be validated. A reply refused with `Busy`
/// is held and offered again on the next [`Process::process`] call.
pub struct EchoServer {
    server: SimpleServer,
    output: SharedSink,
    pending: Option<PacketId>,
}

impl EchoServer {
    /// Server sending replies to `output`
    pub fn new(output: SharedSink) -> Self {
        Self {
            server: SimpleServer::new(),
            output,
            pending: None,
        }
    }

    /// A packet is being served
    pub fn is_busy(&self) -> bool {
        self.server.is_busy()
    }

    fn send(&mut self, pool: &mut PacketPool, reply: PacketId) -> Status {
        if self.output.borrow_mut().sink_packet(pool, reply, 0) == Status::Busy {
            self.pending = Some(reply);
            return Status::Busy;
        }
        pool.dereference(reply);
        self.server.finished_with_packet(pool);
        Status::Good
    }
}

impl PacketSink for EchoServer {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        self.server.sink_packet(pool, packet, header_offset)
    }
}

impl Process for EchoServer {
    fn process(&mut self, pool: &mut PacketPool) -> Status {
        if let Some(reply) = self.pending.take() {
            return self.send(pool, reply);
        }
        let Some(held) = self.server.current() else {
            return Status::Good;
        };

        let payload = pool.get(held.packet).ok().and_then(|buffer| {
            let map = MapPacket::new(buffer.as_slice());
            let data = map.data_at(held.header_offset)?;
            let end = map.data_end().filter(|&end| end >= data)?;
            Some(map.bytes()[data..end].to_vec())
        });
        let Some(payload) = payload else {
            debug!("echo: no payload in {}", held.packet);
            self.server.finished_with_packet(pool);
            return Status::Good;
        };

        let reply = match self.server.prepare_reply(pool, payload.len()) {
            Ok(reply) => reply,
            Err(e) if e.status() == Status::Busy => return Status::Busy,
            Err(e) => {
                warn!("echo: cannot reply to {}: {}", held.packet, e);
                self.server.finished_with_packet(pool);
                return Status::Good;
            }
        };
        if let Err(e) = pool.get_mut(reply).and_then(|mut p| p.append(&payload)) {
            warn!("echo: reply fill failed: {}", e);
            pool.dereference(reply);
            self.server.finished_with_packet(pool);
            return Status::Good;
        }
        self.send(pool, reply)
    }
}
