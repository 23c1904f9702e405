//! Reads buffers produced by `BatchWriter` back into structured batches.
//!
//! This is what an external reader does with the bytes it drains; it is kept here so tools and
//! tests can check what the sampler wrote.

use std::collections::HashMap;

use crate::encoder::{BATCH_END, BATCH_START, SAMPLE_START};
use crate::error::DecodeError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Low 32 bits of the runtime's thread handle.
    pub thread: u32,
    pub native_id: u32,
    pub thread_name: String,
    /// Innermost frame first.
    pub frames: Vec<Frame>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub code: u16,
    pub name: String,
    /// Whether this frame carried the name definition for `code`.
    pub defines: bool,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() - self.pos < len {
            return Err(DecodeError::UnexpectedEnd(self.pos));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let units = self.i32()?;
        if units < 0 {
            return Err(DecodeError::BadString(start));
        }
        let raw = self.take(units as usize * 2)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| DecodeError::BadString(start))
    }
}

/// Decodes one complete buffer. Codes start over with every buffer.
pub fn decode(bytes: &[u8]) -> Result<Batch, DecodeError> {
    let mut reader = Reader { bytes, pos: 0 };
    let mut names: HashMap<u16, String> = HashMap::new();
    let mut batch = Batch::default();

    let first = reader.u8()?;
    if first != BATCH_START {
        return Err(DecodeError::UnexpectedMarker {
            marker: first,
            offset: 0,
        });
    }

    loop {
        let offset = reader.pos;
        match reader.u8()? {
            SAMPLE_START => batch.samples.push(decode_sample(&mut reader, &mut names)?),
            BATCH_END => break,
            marker => return Err(DecodeError::UnexpectedMarker { marker, offset }),
        }
    }

    let trailing = bytes.len() - reader.pos;
    if trailing > 0 {
        return Err(DecodeError::TrailingBytes(trailing));
    }
    Ok(batch)
}

fn decode_sample(
    reader: &mut Reader,
    names: &mut HashMap<u16, String>,
) -> Result<Sample, DecodeError> {
    let thread = reader.i32()? as u32;
    let native_id = reader.i32()? as u32;
    let thread_name = reader.string()?;
    let mut frames = Vec::new();

    loop {
        let offset = reader.pos;
        let code = reader.i16()?;
        if code == 0 {
            break;
        }
        if code > 0 {
            let code = code as u16;
            let name = names
                .get(&code)
                .ok_or(DecodeError::UndefinedCode { code, offset })?;
            frames.push(Frame {
                code,
                name: name.clone(),
                defines: false,
            });
        } else {
            // Definitions come in order: 1, 2, 3, ...
            let code = code.unsigned_abs();
            if code as usize != names.len() + 1 {
                return Err(DecodeError::BadDefinition { code, offset });
            }
            let name = reader.string()?;
            names.insert(code, name.clone());
            frames.push(Frame {
                code,
                name,
                defines: true,
            });
        }
    }

    Ok(Sample {
        thread,
        native_id,
        thread_name,
        frames,
    })
}
