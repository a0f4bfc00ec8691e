//! Read ingress: validation, allow-list filtering and hint normalization.
//!
//! Nothing here touches tag state. A batch comes in, and a timestamp-ordered
//! list of admitted reads (each paired with its facility) comes out, together
//! with one [`ReadProblem`] per rejected read. A bad read never fails the batch.

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::config::defaults::{MAX_EPC_HEX_LEN, MAX_RSSI_DBM, MIN_RSSI_DBM};
use crate::facility::FacilityDirectory;
use crate::types::{Facility, ReadBatch, ReadHint, ReadSource, TagRead};

/// Why a single read was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("EPC is empty")]
    EmptyEpc,
    #[error("EPC '{0}' is longer than {} hex characters", MAX_EPC_HEX_LEN)]
    EpcTooLong(String),
    #[error("EPC '{0}' contains non-hex characters")]
    EpcNotHex(String),
    #[error("timestamp {0} is not a positive epoch millisecond value")]
    BadTimestamp(i64),
    #[error("RSSI {0} dBm is outside the reader range ({} to {} dBm)", MIN_RSSI_DBM, MAX_RSSI_DBM)]
    RssiOutOfRange(i32),
    #[error("read has no device id")]
    MissingDevice,
    #[error("facility '{0}' is not configured")]
    UnknownFacility(String),
    #[error("facility '{0}' is deactivated")]
    InactiveFacility(String),
}

/// A rejected read, reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadProblem {
    /// Position of the read in the submitted batch
    pub index: usize,
    pub epc: String,
    pub device_id: String,
    pub reason: ValidationError,
}

/// A read that passed ingress, with the facility it belongs to.
#[derive(Debug, Clone)]
pub struct AdmittedRead {
    pub read: TagRead,
    pub facility: Arc<Facility>,
}

#[derive(Debug, Default)]
pub struct IngressReport {
    /// Sorted by timestamp, ties kept in submission order
    pub admitted: Vec<AdmittedRead>,
    pub problems: Vec<ReadProblem>,
    /// Valid reads whose EPC the facility allow-list rejected
    pub filtered: usize,
}

/// Normalize and check one read in place.
///
/// EPCs are trimmed and uppercased before the hex check.
pub fn validate_read(read: &mut TagRead) -> Result<(), ValidationError> {
    let epc = read.epc.trim().to_ascii_uppercase();
    if epc.is_empty() {
        return Err(ValidationError::EmptyEpc);
    }
    if epc.len() > MAX_EPC_HEX_LEN {
        return Err(ValidationError::EpcTooLong(epc));
    }
    if !epc.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::EpcNotHex(epc));
    }
    read.epc = epc;

    if read.timestamp <= 0 {
        return Err(ValidationError::BadTimestamp(read.timestamp));
    }
    if !(MIN_RSSI_DBM..=MAX_RSSI_DBM).contains(&read.rssi) {
        return Err(ValidationError::RssiOutOfRange(read.rssi));
    }
    if read.device_id.trim().is_empty() {
        return Err(ValidationError::MissingDevice);
    }
    Ok(())
}

/// Run a batch through validation, facility lookup and the allow-list.
pub fn admit(batch: ReadBatch, facilities: &dyn FacilityDirectory) -> IngressReport {
    let mut report = IngressReport::default();
    let source = batch.source;

    for (index, mut read) in batch.reads.into_iter().enumerate() {
        let checked = validate_read(&mut read).and_then(|()| {
            match facilities.facility(&read.facility_id) {
                None => Err(ValidationError::UnknownFacility(read.facility_id.clone())),
                Some(f) if !f.active => {
                    Err(ValidationError::InactiveFacility(read.facility_id.clone()))
                }
                Some(f) => Ok(f),
            }
        });

        let facility = match checked {
            Ok(f) => f,
            Err(reason) => {
                debug!(index, epc = %read.epc, %reason, "Read rejected");
                report.problems.push(ReadProblem {
                    index,
                    epc: read.epc,
                    device_id: read.device_id,
                    reason,
                });
                continue;
            }
        };

        if !facility.admits(&read.epc) {
            report.filtered += 1;
            continue;
        }

        if source == ReadSource::Handheld {
            read.hint = ReadHint::Arrival;
        }

        report.admitted.push(AdmittedRead { read, facility });
    }

    // Stable sort keeps submission order for equal timestamps
    report.admitted.sort_by_key(|a| a.read.timestamp);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facility::FacilityRegistry;

    fn registry() -> FacilityRegistry {
        let mut filtered = Facility::new("FILTERED");
        filtered.epc_filters = vec!["3034".into()];
        let mut closed = Facility::new("CLOSED");
        closed.active = false;
        FacilityRegistry::new(
            vec![Facility::new("F1"), filtered, closed],
            Facility::new("default"),
        )
    }

    fn read(epc: &str, ts: i64, facility: &str) -> TagRead {
        TagRead::new(epc, -50, ts, "floor-1", facility)
    }

    #[test]
    fn test_validate_uppercases_epc() {
        let mut r = read("  3034abcd ", 1, "F1");
        validate_read(&mut r).unwrap();
        assert_eq!(r.epc, "3034ABCD");
    }

    #[test]
    fn test_validate_rejections() {
        let cases = [
            (read("", 1, "F1"), ValidationError::EmptyEpc),
            (read("XYZ", 1, "F1"), ValidationError::EpcNotHex("XYZ".into())),
            (read(&"A".repeat(65), 1, "F1"), ValidationError::EpcTooLong("A".repeat(65))),
            (read("AB", 0, "F1"), ValidationError::BadTimestamp(0)),
        ];
        for (mut r, expected) in cases {
            assert_eq!(validate_read(&mut r), Err(expected));
        }

        let mut loud = read("AB", 1, "F1");
        loud.rssi = 40;
        assert_eq!(validate_read(&mut loud), Err(ValidationError::RssiOutOfRange(40)));

        let mut anonymous = read("AB", 1, "F1");
        anonymous.device_id = String::new();
        assert_eq!(validate_read(&mut anonymous), Err(ValidationError::MissingDevice));
    }

    #[test]
    fn test_admit_reports_problems_and_continues() {
        let batch = ReadBatch::fixed(vec![
            read("AA", 10, "F1"),
            read("not-hex", 11, "F1"),
            read("BB", 12, "NOWHERE"),
            read("CC", 13, "CLOSED"),
            read("DD", 14, "F1"),
        ]);
        let report = admit(batch, &registry());

        assert_eq!(report.admitted.len(), 2);
        assert_eq!(report.problems.len(), 3);
        assert_eq!(report.problems[0].index, 1);
        assert_eq!(
            report.problems[1].reason,
            ValidationError::UnknownFacility("NOWHERE".into())
        );
        assert_eq!(
            report.problems[2].reason,
            ValidationError::InactiveFacility("CLOSED".into())
        );
    }

    #[test]
    fn test_allow_list_counts_filtered() {
        let batch = ReadBatch::fixed(vec![
            read("3034AA", 1, "FILTERED"),
            read("e280bb", 2, "FILTERED"),
        ]);
        let report = admit(batch, &registry());
        assert_eq!(report.admitted.len(), 1);
        assert_eq!(report.filtered, 1);
        assert!(report.problems.is_empty());
    }

    #[test]
    fn test_handheld_reads_become_arrivals() {
        let batch = ReadBatch::handheld(vec![read("AA", 1, "F1")]);
        let report = admit(batch, &registry());
        assert_eq!(report.admitted[0].read.hint, ReadHint::Arrival);

        let batch = ReadBatch::fixed(vec![read("AA", 1, "F1")]);
        let report = admit(batch, &registry());
        assert_eq!(report.admitted[0].read.hint, ReadHint::Seen);
    }

    #[test]
    fn test_admitted_sorted_by_timestamp() {
        let batch = ReadBatch::fixed(vec![
            read("AA", 30, "F1"),
            read("BB", 10, "F1"),
            read("CC", 20, "F1"),
            read("DD", 10, "F1"),
        ]);
        let report = admit(batch, &registry());
        let order: Vec<&str> = report.admitted.iter().map(|a| a.read.epc.as_str()).collect();
        assert_eq!(order, vec!["BB", "DD", "CC", "AA"]);
    }
}
