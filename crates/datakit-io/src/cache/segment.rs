// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Segment file framing: a sequence of `[u32 little-endian length][JSON entry]` frames.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::cache::{CacheEntry, CacheError};

pub(crate) const SEGMENT_EXTENSION: &str = "seg";
const FRAME_HEADER_LEN: usize = 4;
const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

pub(crate) fn file_name(seq: u64) -> String {
    format!("{seq:020}.{SEGMENT_EXTENSION}")
}

pub(crate) fn parse_seq(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

pub(crate) fn encode_frame(entry: &CacheEntry) -> Result<Vec<u8>, CacheError> {
    let json = serde_json::to_vec(entry)?;
    let len = u32::try_from(json.len()).map_err(|_| CacheError::EntryTooLarge(json.len()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + json.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

pub(crate) fn append(path: &Path, frame: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(frame)?;
    file.sync_data()
}

/// Replaces the contents of `path` through a temporary file and a rename.
pub(crate) fn rewrite(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_data()?;
    }
    fs::rename(&tmp, path)
}

#[derive(Debug, Default)]
pub(crate) struct ReadOutcome {
    pub(crate) entries: Vec<CacheEntry>,
    /// Length of the well-formed prefix.
    pub(crate) valid_len: u64,
    /// The file ends in a partially written frame.
    pub(crate) torn_tail: bool,
    /// A complete frame failed to decode.
    pub(crate) corrupt: bool,
}

pub(crate) fn read(path: &Path) -> io::Result<ReadOutcome> {
    let data = fs::read(path)?;
    let mut outcome = ReadOutcome::default();
    let mut offset = 0;

    while offset < data.len() {
        let Some(header) = data.get(offset..offset + FRAME_HEADER_LEN) else {
            outcome.torn_tail = true;
            break;
        };
        let mut len_bytes = [0u8; FRAME_HEADER_LEN];
        len_bytes.copy_from_slice(header);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            outcome.corrupt = true;
            break;
        }
        let body_start = offset + FRAME_HEADER_LEN;
        let Some(body) = data.get(body_start..body_start + len) else {
            outcome.torn_tail = true;
            break;
        };
        match serde_json::from_slice::<CacheEntry>(body) {
            Ok(entry) => outcome.entries.push(entry),
            Err(_) => {
                outcome.corrupt = true;
                break;
            }
        }
        offset = body_start + len;
        outcome.valid_len = offset as u64;
    }

    Ok(outcome)
}
