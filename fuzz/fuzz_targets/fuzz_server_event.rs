#![no_main]

use chat_sync_client::protocol::{Message, RoomList, ServerEvent};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Realtime frames go through the envelope parser.
    if let Ok(event) = ServerEvent::parse(text) {
        let _ = event.kind();
    }

    // HTTP bodies are decoded straight from bytes.
    let _ = serde_json::from_slice::<RoomList>(data);
    let _ = serde_json::from_slice::<Vec<Message>>(data);
});
