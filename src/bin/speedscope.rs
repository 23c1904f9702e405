// Converts raw capture buffers, one per file, into a speedscope profile on stdout.
extern crate serde_json;
extern crate stackshot;

use std::error::Error;
use std::fs;

use stackshot::decoder::decode;
use stackshot::speedscope::SpeedscopeFile;

fn main() -> Result<(), Box<dyn Error>> {
    let mut batches = Vec::new();
    for path in std::env::args().skip(1) {
        let bytes = fs::read(&path)?;
        let batch = decode(&bytes).map_err(|err| format!("{}: {}", path, err))?;
        batches.push(batch);
    }
    if batches.is_empty() {
        return Err("usage: speedscope <capture file>...".into());
    }

    let speed = SpeedscopeFile::from_batches(&batches);
    let stdout = std::io::stdout();
    serde_json::to_writer_pretty(stdout.lock(), &speed)?;
    Ok(())
}
