//! The machine capability set: the trait a replicated state machine module
//! implements, plus the reference key-value machine used by the tests and
//! as a starting point for embedders. Commands and queries are opaque byte
//! sequences from the runtime's perspective; machines must be
//! deterministic.

use std::collections::HashMap;

use crate::types::{HistoryId, Seqno};
use crate::utils::ConclaveError;

use serde::{Deserialize, Serialize};

/// Leader-side admission decision for a submitted command.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandDecision {
    /// Submit the command to the replicated log; the reply is produced by
    /// `apply_command` once the entry commits.
    Apply,

    /// Reject immediately with the given reply, consuming no log slot.
    /// Rejection must be deterministic.
    Reject(Vec<u8>),
}

/// A user-supplied deterministic state machine module.
pub trait Machine: Send + 'static {
    /// One-time initialization when the runtime starts.
    fn init(&mut self) -> Result<(), ConclaveError> {
        Ok(())
    }

    /// Leader-side admission of a command.
    fn handle_command(&mut self, payload: &[u8]) -> CommandDecision;

    /// Read-only query against the currently applied state. Served on any
    /// role; callers wanting linearizability sync a revision first.
    fn handle_query(&self, payload: &[u8]) -> Vec<u8>;

    /// Applies a committed command; returns the reply for the submitting
    /// client. `revision` is the externally visible `(history, seqno)` of
    /// the entry.
    fn apply_command(
        &mut self,
        payload: &[u8],
        revision: (HistoryId, Seqno),
    ) -> Vec<u8>;

    /// Out-of-band message delivered to the machine.
    fn handle_info(&mut self, _payload: &[u8]) {}

    /// Teardown before the runtime stops.
    fn terminate(&mut self) {}
}

/// Command to the reference key-value machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum KvCommand {
    /// Put a new value into key.
    Put { key: String, value: String },

    /// Remove a key.
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>, ConclaveError> {
        Ok(rmp_serde::encode::to_vec(self)?)
    }
}

/// Query to the reference key-value machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum KvQuery {
    /// Get the value of given key.
    Get { key: String },
}

impl KvQuery {
    pub fn encode(&self) -> Result<Vec<u8>, ConclaveError> {
        Ok(rmp_serde::encode::to_vec(self)?)
    }
}

/// Reply from the reference key-value machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum KvResult {
    /// `Some(old_value)` if key was present, else `None`.
    Put { old_value: Option<String> },

    /// `Some(value)` if key was removed, else `None`.
    Delete { old_value: Option<String> },

    /// `Some(value)` if key is present, else `None`.
    Get { value: Option<String> },

    /// Malformed payload.
    BadPayload,
}

impl KvResult {
    pub fn decode(bytes: &[u8]) -> Result<Self, ConclaveError> {
        Ok(rmp_serde::decode::from_slice(bytes)?)
    }

    fn encode(&self) -> Vec<u8> {
        // encoding a derived enum into a fresh buffer cannot fail
        rmp_serde::encode::to_vec(self).unwrap()
    }
}

/// The reference key-value machine: a `String -> String` map.
#[derive(Debug, Default)]
pub struct KvMachine {
    state: HashMap<String, String>,
}

impl KvMachine {
    pub fn new() -> Self {
        KvMachine {
            state: HashMap::new(),
        }
    }
}

impl Machine for KvMachine {
    fn handle_command(&mut self, payload: &[u8]) -> CommandDecision {
        // malformed commands are rejected deterministically without
        // consuming a log slot
        match rmp_serde::decode::from_slice::<KvCommand>(payload) {
            Ok(_) => CommandDecision::Apply,
            Err(_) => CommandDecision::Reject(KvResult::BadPayload.encode()),
        }
    }

    fn handle_query(&self, payload: &[u8]) -> Vec<u8> {
        match rmp_serde::decode::from_slice::<KvQuery>(payload) {
            Ok(KvQuery::Get { key }) => KvResult::Get {
                value: self.state.get(&key).cloned(),
            }
            .encode(),
            Err(_) => KvResult::BadPayload.encode(),
        }
    }

    fn apply_command(
        &mut self,
        payload: &[u8],
        _revision: (HistoryId, Seqno),
    ) -> Vec<u8> {
        match rmp_serde::decode::from_slice::<KvCommand>(payload) {
            Ok(KvCommand::Put { key, value }) => KvResult::Put {
                old_value: self.state.insert(key, value),
            }
            .encode(),
            Ok(KvCommand::Delete { key }) => KvResult::Delete {
                old_value: self.state.remove(&key),
            }
            .encode(),
            Err(_) => KvResult::BadPayload.encode(),
        }
    }
}

#[cfg(test)]
mod machine_tests {
    use super::*;

    fn apply_put(
        machine: &mut KvMachine,
        key: &str,
        value: &str,
        seqno: Seqno,
    ) -> KvResult {
        let payload = KvCommand::Put {
            key: key.into(),
            value: value.into(),
        }
        .encode()
        .unwrap();
        KvResult::decode(
            &machine.apply_command(&payload, ("h0".into(), seqno)),
        )
        .unwrap()
    }

    fn query_get(machine: &KvMachine, key: &str) -> KvResult {
        let payload = KvQuery::Get { key: key.into() }.encode().unwrap();
        KvResult::decode(&machine.handle_query(&payload)).unwrap()
    }

    #[test]
    fn get_empty() {
        let machine = KvMachine::new();
        assert_eq!(query_get(&machine, "president"), KvResult::Get {
            value: None
        });
    }

    #[test]
    fn put_one_get_one() {
        let mut machine = KvMachine::new();
        assert_eq!(apply_put(&mut machine, "k", "v1", 1), KvResult::Put {
            old_value: None
        });
        assert_eq!(query_get(&machine, "k"), KvResult::Get {
            value: Some("v1".into())
        });
    }

    #[test]
    fn put_twice_returns_old() {
        let mut machine = KvMachine::new();
        apply_put(&mut machine, "k", "v1", 1);
        assert_eq!(apply_put(&mut machine, "k", "v2", 2), KvResult::Put {
            old_value: Some("v1".into())
        });
    }

    #[test]
    fn delete_roundtrip() {
        let mut machine = KvMachine::new();
        apply_put(&mut machine, "k", "v1", 1);
        let payload =
            KvCommand::Delete { key: "k".into() }.encode().unwrap();
        let reply = machine.apply_command(&payload, ("h0".into(), 2));
        assert_eq!(KvResult::decode(&reply).unwrap(), KvResult::Delete {
            old_value: Some("v1".into())
        });
        assert_eq!(query_get(&machine, "k"), KvResult::Get { value: None });
    }

    fn gen_rand_str(len: usize) -> String {
        use rand::Rng;
        rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    #[test]
    fn put_rand_get_rand() {
        use rand::seq::SliceRandom;

        let mut machine = KvMachine::new();
        let mut ref_state = std::collections::HashMap::new();
        for seqno in 1..=100 {
            let key = gen_rand_str(1);
            let value = gen_rand_str(10);
            assert_eq!(
                apply_put(&mut machine, &key, &value, seqno),
                KvResult::Put {
                    old_value: ref_state.insert(key, value)
                }
            );
        }
        let keys: Vec<&String> = ref_state.keys().collect();
        for _ in 0..100 {
            let key: String = if rand::random() {
                (*keys.choose(&mut rand::thread_rng()).unwrap()).into()
            } else {
                "nonexist!".into()
            };
            assert_eq!(
                query_get(&machine, &key),
                KvResult::Get {
                    value: ref_state.get(&key).cloned()
                }
            );
        }
    }

    #[test]
    fn malformed_command_rejected() {
        let mut machine = KvMachine::new();
        match machine.handle_command(b"not msgpack") {
            CommandDecision::Reject(reply) => {
                assert_eq!(
                    KvResult::decode(&reply).unwrap(),
                    KvResult::BadPayload
                );
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn wellformed_command_admitted() {
        let mut machine = KvMachine::new();
        let payload = KvCommand::Put {
            key: "k".into(),
            value: "v".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(
            machine.handle_command(&payload),
            CommandDecision::Apply
        );
    }
}
