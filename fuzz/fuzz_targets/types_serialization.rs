#![no_main]

use conveyor_types::{LockRecord, RunRecord, SyncEvent};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else { return };

    if let Ok(record) = serde_json::from_str::<RunRecord>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&record) {
            if let Ok(parsed) = serde_json::from_str::<RunRecord>(&roundtripped) {
                assert_eq!(record.run_id, parsed.run_id);
                assert_eq!(record.steps.len(), parsed.steps.len());
            }
        }
    }

    if let Ok(lock) = serde_json::from_str::<LockRecord>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&lock) {
            if let Ok(parsed) = serde_json::from_str::<LockRecord>(&roundtripped) {
                assert_eq!(lock.run_id, parsed.run_id);
                assert_eq!(lock.invocation_id, parsed.invocation_id);
            }
        }
    }

    if let Ok(event) = serde_json::from_str::<SyncEvent>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&event) {
            if let Ok(parsed) = serde_json::from_str::<SyncEvent>(&roundtripped) {
                assert_eq!(event.run_id, parsed.run_id);
                assert_eq!(event.message, parsed.message);
            }
        }
    }
});
