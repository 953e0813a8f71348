#![no_main]

use exam_monitor_client::protocol::ServerMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(msg) = serde_json::from_slice::<ServerMessage>(data) else {
        return;
    };
    // Anything that parses must survive a re-encode and keep its kind.
    let json = serde_json::to_string(&msg).unwrap_or_default();
    if let Ok(again) = serde_json::from_str::<ServerMessage>(&json) {
        assert_eq!(again.kind(), msg.kind());
    }
});
