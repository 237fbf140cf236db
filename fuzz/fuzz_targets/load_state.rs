#![no_main]

use std::fs;

use conveyor_state::RunStore;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;
use uuid::Uuid;

fuzz_target!(|data: &[u8]| {
    let Ok(td) = tempdir() else { return };
    let run_id = Uuid::nil();

    let run_dir = td.path().join(run_id.to_string());
    if fs::create_dir_all(&run_dir).is_err() {
        return;
    }
    if fs::write(run_dir.join("run.json"), data).is_err() {
        return;
    }

    let store = RunStore::new(td.path());
    let _ = store.load(run_id);
});
