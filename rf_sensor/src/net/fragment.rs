// Packets larger than one RF payload travel as numbered fragments:
// sequence u8 | index u8 | count u8 | chunk
use super::framing::MAX_RF_PAYLOAD;
use crate::errors::TransportError;
use std::collections::HashMap;
use tracing::trace;

pub const HEADER_LEN: usize = 3;

/// Payload bytes carried by one fragment.
pub const CHUNK_LEN: usize = MAX_RF_PAYLOAD - HEADER_LEN;

/// Fragments per packet; bounds a packet to roughly 4 KiB on the radio.
pub const MAX_FRAGMENTS: usize = 16;

/// Cuts `data` into RF payloads tagged with `sequence`.
pub fn split(sequence: u8, data: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
    let count = data.len().div_ceil(CHUNK_LEN).max(1);
    if count > MAX_FRAGMENTS {
        return Err(TransportError::Frame(format!(
            "packet of {} bytes needs {count} fragments, at most {MAX_FRAGMENTS} allowed",
            data.len()
        )));
    }
    let mut chunks: Vec<&[u8]> = data.chunks(CHUNK_LEN).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut payload = Vec::with_capacity(HEADER_LEN + chunk.len());
            payload.extend_from_slice(&[sequence, index as u8, count as u8]);
            payload.extend_from_slice(chunk);
            payload
        })
        .collect())
}

#[derive(Debug)]
struct Partial {
    sequence: u8,
    parts: Vec<Option<Vec<u8>>>,
}

/// Collects fragments per source radio. Only the newest packet of each
/// source is kept; a fragment with another sequence number discards it.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<u64, Partial>,
}

impl Reassembler {
    /// Adds one fragment from `source`; returns the packet bytes once complete.
    pub fn push(&mut self, source: u64, fragment: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        let Some((&[sequence, index, count], chunk)) = fragment.split_first_chunk::<HEADER_LEN>() else {
            return Err(TransportError::Frame(format!("fragment of {} bytes", fragment.len())));
        };
        let (index, count) = (usize::from(index), usize::from(count));
        if count == 0 || count > MAX_FRAGMENTS || index >= count {
            return Err(TransportError::Frame(format!("fragment {index} of {count}")));
        }
        if count == 1 {
            return Ok(Some(chunk.to_vec()));
        }

        let partial = self.partial.entry(source).or_insert_with(|| Partial {
            sequence,
            parts: vec![None; count],
        });
        if partial.sequence != sequence || partial.parts.len() != count {
            trace!(
                source = format_args!("{source:016x}"),
                old = partial.sequence,
                new = sequence,
                "dropping incomplete packet"
            );
            *partial = Partial { sequence, parts: vec![None; count] };
        }
        partial.parts[index] = Some(chunk.to_vec());
        if partial.parts.iter().any(Option::is_none) {
            return Ok(None);
        }

        let parts = self.partial.remove(&source).map(|p| p.parts).unwrap_or_default();
        Ok(Some(parts.into_iter().flatten().flatten().collect()))
    }

    /// Sources with a packet still missing fragments.
    pub fn incomplete(&self) -> usize {
        self.partial.len()
    }
}
