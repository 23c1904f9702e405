// Prints a raw capture buffer as JSON, one batch per input file.
extern crate serde_json;
extern crate stackshot;

use std::error::Error;
use std::fs;
use std::io::Write;

use stackshot::decoder::decode;

fn main() -> Result<(), Box<dyn Error>> {
    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        return Err("usage: decode <capture file>...".into());
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for path in paths {
        let bytes = fs::read(&path)?;
        let batch = decode(&bytes).map_err(|err| format!("{}: {}", path, err))?;
        serde_json::to_writer(&mut out, &batch)?;
        writeln!(out)?;
    }
    Ok(())
}
