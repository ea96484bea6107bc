#![no_main]

#[path = "../../tests/common/mod.rs"]
mod common;

use common::{ToyCompiler, ToyCpu, ToyDecoder};
use libfuzzer_sys::fuzz_target;
use x86_memcore::{CodeBlockCombiner, LazyBlock, MemorySystem, RomBlock};

fuzz_target!(|data: &[u8]| {
    if data.len() < 6 {
        return;
    }

    let addr = u32::from_le_bytes([data[0], data[1], data[2], 0]) & 0x1FFF;
    let entry = u32::from(u16::from_le_bytes([data[3], data[4]])) & 0x1FFF;
    let rom_high = data[5] & 1 == 1;
    let payload = &data[6..];

    let mut memory = MemorySystem::new();
    let _ = memory.map_shared(0, LazyBlock::new());
    let _ = if rom_high {
        memory.map_shared(1, RomBlock::padded(payload, 0xC3))
    } else {
        memory.map_shared(1, LazyBlock::new())
    };

    memory.physical().copy_in(addr, payload);
    let mut back = vec![0u8; payload.len()];
    memory.linear().copy_out(addr, &mut back);

    let _ = memory.physical().get_quadword(addr);
    memory.linear().set_doubleword(addr, 0xC390_9090);

    let mut combiner = CodeBlockCombiner::new(ToyDecoder::default(), ToyCompiler::default());
    let mut cpu = ToyCpu::default();
    let _ = memory.physical().execute_at(entry, &mut cpu, &mut combiner);
    memory.physical().copy_in(entry, &[0xEB, 0x00]);
    let _ = memory.linear().execute_at(entry, &mut cpu, &mut combiner);
});
