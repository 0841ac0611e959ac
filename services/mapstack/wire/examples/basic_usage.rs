//! Basic usage example for the mapstack wire layers.

use mapstack_wire::{
    sink_c78, source_c78, ControlPrefix, HeaderFlags, MapPacket, MepDecoder, MepEncoder,
    Opcode, PacketId, PacketPool, PacketSink, Process, Status,
};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Default)]
struct Printer {
    received: usize,
}

impl PacketSink for Printer {
    fn sink_packet(&mut self, pool: &mut PacketPool, packet: PacketId, header_offset: u8) -> Status {
        let Ok(buffer) = pool.get(packet) else {
            return Status::Bad;
        };
        let map = MapPacket::new(buffer.as_slice());
        let data = map.data_at(header_offset).unwrap_or(0);
        println!(
            "   Received {}: {:02x?} payload {:?}",
            packet,
            map.bytes(),
            String::from_utf8_lossy(&map.bytes()[data..])
        );
        self.received += 1;
        Status::Good
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== mapstack Wire Example ===\n");

    // 1. Code78 integers
    println!("1. Code78 encoding...");
    let mut encoded: Vec<u8> = Vec::new();
    sink_c78(&mut encoded, 300);
    let (value, next) = source_c78(&encoded, 0)?;
    println!("   300 -> {:02x?} -> {} ({} bytes)", encoded, value, next);

    // 2. Build a MAP packet addressed to 3/0x15 from 3/0x07
    println!("\n2. Building a MAP packet...");
    let mut pool = PacketPool::default();
    let header = (HeaderFlags::DEST_ADDRESS_PRESENT | HeaderFlags::SRC_ADDRESS_PRESENT).bits() | 3;
    let packet = pool.allocate_from(&[header, 0x15, 0x07, b'<', b'h', b'i', b'<'])?;
    pool.get_mut(packet)?.append_checksum(0)?;
    println!("   Packet bytes: {:02x?}", pool.get(packet)?.as_slice());

    // 3. Frame it with MEP
    println!("\n3. MEP encoding with prefix '<'...");
    let prefix = ControlPrefix::new(b'<')?;
    let mut encoder = MepEncoder::with_prefix(Vec::<u8>::new(), prefix);
    encoder.sink_packet(&mut pool, packet, 0);
    pool.dereference(packet);
    while encoder.process(&mut pool) == Status::Busy {}
    let wire = encoder.output().clone();
    println!("   Wire bytes:   {:02x?}", wire);

    // 4. Decode it again after some noise the sender aborted
    println!("\n4. MEP decoding...");
    let printer = Rc::new(RefCell::new(Printer::default()));
    let mut decoder = MepDecoder::new(printer.clone());
    let mut stream = b"junk".to_vec();
    stream.extend_from_slice(&[prefix.byte(), prefix.with_opcode(Opcode::BadPacket)]);
    stream.extend_from_slice(&wire);
    decoder.sink_slice(&mut pool, &stream);
    println!("   Packets delivered: {}", printer.borrow().received);
    println!("   Live packets left: {}", pool.live_count());

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
