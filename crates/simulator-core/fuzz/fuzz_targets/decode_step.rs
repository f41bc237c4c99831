#![no_main]

use libfuzzer_sys::fuzz_target;
use simulator_core::syscall::nr;
use simulator_core::{
    Decoder, Permissions, SegmentImage, Simulator, SimulatorConfig, StaticImageLoader,
    TraceOutput,
};

const BASE: u32 = 0x0001_0000;
const STEPS: usize = 64;

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let word = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let ext = data
        .get(4..8)
        .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
    let _ = Decoder::decode(BASE, word, ext);

    let loader = StaticImageLoader::code(BASE, data.to_vec()).with_segment(SegmentImage::new(
        0x0002_0000,
        data.to_vec(),
        Permissions::RW,
        "[data]",
    ));
    let config = SimulatorConfig {
        trace_output: TraceOutput::Memory,
        host_signals: Vec::new(),
        ..SimulatorConfig::default()
    };
    let Ok(mut sim) = Simulator::with_loader(config, Box::new(loader)) else {
        return;
    };
    for number in [nr::OPEN, nr::NANOSLEEP] {
        sim.syscall_table().clear_body(number);
    }
    let Ok(process) = sim.exec(&["fuzz".to_string()]) else {
        return;
    };
    let pid = process.pid();
    for _ in 0..STEPS {
        if process.is_terminated() {
            break;
        }
        process.step(pid);
    }
});
