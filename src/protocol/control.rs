//! The gossiped link-health report.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Periodic report of how many bytes the sender received over each link
/// within its stats window. Sequence numbers are per-direction; the
/// receiver discards any report that is not strictly newer than the last
/// one it processed.
///
/// The `received` map is a `BTreeMap` so the bincode encoding is
/// deterministic regardless of how the map was built; both ends of a
/// deployment run the same build, which is the whole interop contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReport {
    pub seq: u64,
    /// Wire link id -> bytes received over that link.
    pub received: BTreeMap<u16, u64>,
}

impl ControlReport {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| ProtocolError::ControlEncode(e.to_string()).into())
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        bincode::deserialize(raw)
            .map_err(|e| ProtocolError::ControlDecode(e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let report = ControlReport {
            seq: 42,
            received: BTreeMap::from([(1, 1500), (2, 0), (255, u64::MAX)]),
        };
        let wire = report.encode().unwrap();
        assert_eq!(ControlReport::decode(&wire).unwrap(), report);
    }

    #[test]
    fn empty_report_roundtrips() {
        let report = ControlReport {
            seq: 0,
            received: BTreeMap::new(),
        };
        let wire = report.encode().unwrap();
        assert_eq!(ControlReport::decode(&wire).unwrap(), report);
    }

    #[test]
    fn encoding_is_independent_of_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert(1, 10);
        a.insert(2, 20);
        a.insert(3, 30);
        let mut b = BTreeMap::new();
        b.insert(3, 30);
        b.insert(1, 10);
        b.insert(2, 20);
        let ra = ControlReport { seq: 9, received: a };
        let rb = ControlReport { seq: 9, received: b };
        assert_eq!(ra.encode().unwrap(), rb.encode().unwrap());
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(ControlReport::decode(&[0xff; 3]).is_err());
    }
}
