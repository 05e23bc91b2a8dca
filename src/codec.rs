//! Wire shape of log entry payloads.
//!
//! Each entry travels as a length-prefixed record: a 4-byte big-endian length
//! followed by a JSON `{index, term, type_tag, payload}` body, where `payload`
//! is the JSON encoding of the command itself.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::machine::Command;
use crate::types::{LogEntry, LogIndex, Term};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub index: LogIndex,
    pub term: Term,
    pub type_tag: String,
    pub payload: Vec<u8>,
}

impl CommandRecord {
    pub fn for_command<C: Command>(index: LogIndex, term: Term, command: &C) -> Result<Self> {
        Ok(Self {
            index,
            term,
            type_tag: command.type_tag().to_string(),
            payload: serde_json::to_vec(command)?,
        })
    }

    pub fn command<C: Command>(&self) -> Result<C> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Frame the record for the log and the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        let Ok(len) = u32::try_from(body.len()) else {
            return Err(Error::invariant("command record exceeds 4 GiB"));
        };
        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    pub fn decode(framed: &[u8]) -> Result<Self> {
        let Some((prefix, body)) = framed.split_first_chunk::<4>() else {
            return Err(Error::invariant("command record shorter than its length prefix"));
        };
        let len = u32::from_be_bytes(*prefix) as usize;
        if body.len() != len {
            return Err(Error::invariant(format!(
                "command record length {len} does not match {} body bytes",
                body.len()
            )));
        }
        Ok(serde_json::from_slice(body)?)
    }
}

/// Encode `command` as the log entry for `index` in `term`.
pub fn encode_entry<C: Command>(index: LogIndex, term: Term, command: &C) -> Result<LogEntry> {
    let payload = CommandRecord::for_command(index, term, command)?.encode()?;
    Ok(LogEntry {
        index,
        term,
        payload,
    })
}
