use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::machine::{Command, StateMachine};

/// Commands for the key-value store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
    /// Set `key` to `value` only if it currently holds `expected`.
    CompareAndSet {
        key: String,
        expected: Option<String>,
        value: String,
    },
}

impl Command for KvCommand {
    fn type_tag(&self) -> &'static str {
        match self {
            KvCommand::Get { .. } => "kv.get",
            KvCommand::Set { .. } => "kv.set",
            KvCommand::Delete { .. } => "kv.delete",
            KvCommand::CompareAndSet { .. } => "kv.cas",
        }
    }
}

/// Result of applying a command to the KV store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvResult {
    Ok,
    Value(Option<String>),
}

/// A simple in-memory key-value store.
#[derive(Default)]
pub struct KvStore {
    data: HashMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    /// Read a key without going through the log.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

impl StateMachine for KvStore {
    type Command = KvCommand;
    type Output = KvResult;

    fn apply(&mut self, command: KvCommand) -> Result<KvResult, String> {
        match command {
            KvCommand::Get { key } => Ok(KvResult::Value(self.data.get(&key).cloned())),
            KvCommand::Set { key, value } => {
                self.data.insert(key, value);
                Ok(KvResult::Ok)
            }
            KvCommand::Delete { key } => {
                self.data.remove(&key);
                Ok(KvResult::Ok)
            }
            KvCommand::CompareAndSet {
                key,
                expected,
                value,
            } => {
                let current = self.data.get(&key);
                if current != expected.as_ref() {
                    return Err(format!(
                        "compare-and-set on '{key}' expected {expected:?}, found {current:?}"
                    ));
                }
                self.data.insert(key, value);
                Ok(KvResult::Ok)
            }
        }
    }
}
