#![no_main]
use chrono::Utc;
use libfuzzer_sys::fuzz_target;
use powermonitor::commands::{commands, handle};
use powermonitor::store::Telegram;
use powermonitor::telegram::frame_complete;

fuzz_target!(|data: &[u8]| {
    let _ = frame_complete(data);

    let telegram = Telegram::from_bytes(data.to_vec(), Utc::now());
    for command in commands() {
        if command.name == "help" {
            continue;
        }
        let _ = handle(command.name, Some(&telegram), None);
    }
    let _ = handle(&telegram.text(), Some(&telegram), None);
});
