#![no_main]
use libfuzzer_sys::fuzz_target;
use powermonitor::modbus::{decode_registers, descriptors, register_value};

fuzz_target!(|data: &[u8]| {
    // Interpret the input as a register reply payload of arbitrary length
    let mut regs = Vec::new();
    if decode_registers(data, &mut regs).is_err() {
        return;
    }

    // Every known field must decode or report the block as too short
    for d in descriptors() {
        let _ = register_value(&regs, d.field_id);
    }
    let _ = register_value(&regs, 0);
});
