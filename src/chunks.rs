//! Chunk Reassembler
//!
//! Peers with limited message size split a large response into an ordered
//! sequence of partial fragments. The first fragment (index 0) is the
//! response shell: status, headers and so on, with a partial `data` field.
//! Followup fragments carry only `data`. Fragments may arrive in any order
//! because delivery order across independent message channels is not
//! guaranteed; the reassembler buffers followups that arrive before their
//! shell.
//!
//! Each fragment is a JSON object with at least:
//!
//! ```text
//! { "id": <response id>, "index": <u64>, "totalChunks": <u64>, "data": <string> }
//! ```
//!
//! The assembler is per-connection. Dropping it discards any orphaned
//! partial responses, which is exactly what connection teardown needs.

use log::{debug, warn};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Outcome of ingesting one fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    /// All fragments received; carries the completed response shell with the
    /// concatenated body in its `data` field.
    Complete(JsonValue),
    /// More fragments are needed, or the fragment was dropped (late or
    /// duplicate fragments are logged and ignored).
    Pending,
}

/// Partially received response, keyed by response id in the assembler.
#[derive(Debug, Default)]
struct PartialResponse {
    /// Declared total fragment count, taken from the first fragment seen.
    total_chunks: Option<u64>,
    /// The index-0 response shell, if received.
    initial: Option<JsonValue>,
    /// Fragment index → raw payload, for fragments with index > 0.
    followups: BTreeMap<u64, String>,
}

impl PartialResponse {
    fn received(&self) -> u64 {
        let initial = if self.initial.is_some() { 1 } else { 0 };
        initial + self.followups.len() as u64
    }
}

/// Errors raised for fragments the assembler cannot interpret at all.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("malformed chunk: {0}")]
    Malformed(String),
}

/// Reassembles chunked responses for a single connection.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    partial: HashMap<String, PartialResponse>,
    /// Ids already delivered. Late fragments for these are dropped instead
    /// of being re-buffered as speculative orphans.
    completed: HashSet<String>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one fragment.
    ///
    /// The completion check fires after every ingest: once the received count
    /// (shell plus followups) equals the declared total, the shell's `data`
    /// field is replaced with the concatenation of all payloads in numeric
    /// index order, the accumulator entry is removed and the completed shell
    /// is returned.
    pub fn ingest(&mut self, chunk: JsonValue) -> Result<Ingest, ChunkError> {
        let id = chunk
            .get("id")
            .and_then(id_as_string)
            .ok_or_else(|| ChunkError::Malformed("chunk is missing 'id'".into()))?;
        let index = chunk
            .get("index")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ChunkError::Malformed("chunk is missing 'index'".into()))?;
        let total_chunks = chunk
            .get("totalChunks")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ChunkError::Malformed("chunk is missing 'totalChunks'".into()))?;
        if total_chunks == 0 || index >= total_chunks {
            return Err(ChunkError::Malformed(format!(
                "chunk index {} out of range for {} total chunks",
                index, total_chunks
            )));
        }

        if self.completed.contains(&id) {
            debug!("dropping late chunk {} for completed response {}", index, id);
            return Ok(Ingest::Pending);
        }

        // Single-fragment response: complete immediately, never enters the
        // accumulator.
        if index == 0 && total_chunks == 1 && !self.partial.contains_key(&id) {
            self.completed.insert(id);
            return Ok(Ingest::Complete(chunk));
        }

        let entry = self.partial.entry(id.clone()).or_default();
        let total = *entry.total_chunks.get_or_insert(total_chunks);
        if total != total_chunks {
            warn!(
                "chunk for response {} declares {} total chunks, first seen {}; keeping {}",
                id, total_chunks, total, total
            );
        }

        if index == 0 {
            if entry.initial.is_some() {
                warn!("dropping duplicate initial chunk for response {}", id);
                return Ok(Ingest::Pending);
            }
            entry.initial = Some(chunk);
        } else {
            let data = chunk
                .get("data")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ChunkError::Malformed("followup chunk is missing 'data'".into()))?
                .to_string();
            if entry.followups.insert(index, data).is_some() {
                warn!("replacing duplicate chunk {} for response {}", index, id);
            }
        }

        if entry.received() == total {
            let entry = self
                .partial
                .remove(&id)
                .expect("entry was just inserted or updated");
            self.completed.insert(id.clone());
            return Ok(Ingest::Complete(Self::assemble(&id, entry)?));
        }
        Ok(Ingest::Pending)
    }

    /// Number of responses still being tracked.
    pub fn pending_len(&self) -> usize {
        self.partial.len()
    }

    /// Whether the given response id is still being tracked.
    pub fn is_tracking(&self, id: &str) -> bool {
        self.partial.contains_key(id)
    }

    fn assemble(id: &str, entry: PartialResponse) -> Result<JsonValue, ChunkError> {
        let mut shell = entry.initial.ok_or_else(|| {
            ChunkError::Malformed(format!(
                "response {} reached its declared chunk count without an initial chunk",
                id
            ))
        })?;
        let mut body = shell
            .get("data")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        for payload in entry.followups.values() {
            body.push_str(payload);
        }
        shell["data"] = JsonValue::String(body);
        Ok(shell)
    }
}

fn id_as_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shell(id: &str, total: u64, data: &str) -> JsonValue {
        json!({
            "id": id,
            "index": 0,
            "totalChunks": total,
            "status": 200,
            "headers": [],
            "data": data,
        })
    }

    fn followup(id: &str, index: u64, total: u64, data: &str) -> JsonValue {
        json!({"id": id, "index": index, "totalChunks": total, "data": data})
    }

    #[test]
    fn test_single_chunk_completes_immediately() {
        let mut assembler = ChunkAssembler::new();
        let out = assembler.ingest(shell("1", 1, "hello")).unwrap();
        match out {
            Ingest::Complete(value) => assert_eq!(value["data"], "hello"),
            Ingest::Pending => panic!("single chunk should complete"),
        }
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_in_order_reassembly() {
        let mut assembler = ChunkAssembler::new();
        assert_eq!(assembler.ingest(shell("1", 3, "one ")).unwrap(), Ingest::Pending);
        assert_eq!(
            assembler.ingest(followup("1", 1, 3, "two ")).unwrap(),
            Ingest::Pending
        );
        let out = assembler.ingest(followup("1", 2, 3, "three")).unwrap();
        match out {
            Ingest::Complete(value) => {
                assert_eq!(value["data"], "one two three");
                assert_eq!(value["status"], 200);
            }
            Ingest::Pending => panic!("should be complete"),
        }
        assert!(!assembler.is_tracking("1"));
    }

    #[test]
    fn test_out_of_order_reassembly() {
        // Followup arrives before the initial shell.
        let mut assembler = ChunkAssembler::new();
        assert_eq!(
            assembler.ingest(followup("1", 1, 2, "lo")).unwrap(),
            Ingest::Pending
        );
        assert!(assembler.is_tracking("1"));
        let out = assembler.ingest(shell("1", 2, "hel")).unwrap();
        match out {
            Ingest::Complete(value) => assert_eq!(value["data"], "hello"),
            Ingest::Pending => panic!("should be complete"),
        }
    }

    #[test]
    fn test_all_permutations_of_three_chunks() {
        let chunks = [
            shell("r", 3, "aa"),
            followup("r", 1, 3, "bb"),
            followup("r", 2, 3, "cc"),
        ];
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut assembler = ChunkAssembler::new();
            let mut completed = Vec::new();
            for i in order {
                if let Ingest::Complete(value) = assembler.ingest(chunks[i].clone()).unwrap() {
                    completed.push(value);
                }
            }
            assert_eq!(completed.len(), 1, "order {:?}", order);
            assert_eq!(completed[0]["data"], "aabbcc", "order {:?}", order);
            assert_eq!(assembler.pending_len(), 0);
        }
    }

    #[test]
    fn test_late_chunk_is_dropped() {
        let mut assembler = ChunkAssembler::new();
        assembler.ingest(shell("1", 2, "hel")).unwrap();
        assembler.ingest(followup("1", 1, 2, "lo")).unwrap();
        // A straggler for the already-completed id must not start new tracking.
        assert_eq!(
            assembler.ingest(followup("1", 1, 2, "lo")).unwrap(),
            Ingest::Pending
        );
        assert!(!assembler.is_tracking("1"));
    }

    #[test]
    fn test_duplicate_initial_is_dropped() {
        let mut assembler = ChunkAssembler::new();
        assembler.ingest(shell("1", 3, "a")).unwrap();
        assert_eq!(assembler.ingest(shell("1", 3, "z")).unwrap(), Ingest::Pending);
        assembler.ingest(followup("1", 1, 3, "b")).unwrap();
        let out = assembler.ingest(followup("1", 2, 3, "c")).unwrap();
        match out {
            Ingest::Complete(value) => assert_eq!(value["data"], "abc"),
            Ingest::Pending => panic!("should be complete"),
        }
    }

    #[test]
    fn test_numeric_id_accepted() {
        let mut assembler = ChunkAssembler::new();
        let chunk = json!({"id": 42, "index": 0, "totalChunks": 1, "data": "x"});
        assert!(matches!(assembler.ingest(chunk).unwrap(), Ingest::Complete(_)));
    }

    #[test]
    fn test_malformed_chunks_rejected() {
        let mut assembler = ChunkAssembler::new();
        assert!(assembler.ingest(json!({"index": 0, "totalChunks": 1})).is_err());
        assert!(assembler.ingest(json!({"id": "1", "totalChunks": 1})).is_err());
        assert!(assembler
            .ingest(json!({"id": "1", "index": 5, "totalChunks": 2, "data": ""}))
            .is_err());
        assert!(assembler
            .ingest(json!({"id": "1", "index": 0, "totalChunks": 0, "data": ""}))
            .is_err());
    }

    #[test]
    fn test_teardown_discards_orphans() {
        let mut assembler = ChunkAssembler::new();
        assembler.ingest(followup("orphan", 1, 5, "x")).unwrap();
        assert_eq!(assembler.pending_len(), 1);
        drop(assembler);
    }
}
