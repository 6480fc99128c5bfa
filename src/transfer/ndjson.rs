use serde::Deserialize;

use super::{TransferError, TransferEvent, TransferKind};

/// One NDJSON progress object. Every field is optional.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct ProgressLine {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Decode one raw line. Blank lines yield `None`; an `error` field wins over
/// everything else on the line.
pub(crate) fn translate(
    kind: TransferKind,
    raw: &[u8],
) -> Result<Option<TransferEvent>, TransferError> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let line: ProgressLine =
        serde_json::from_str(text).map_err(|source| TransferError::MalformedLine {
            line: text.to_string(),
            source,
        })?;

    if let Some(message) = line.error {
        return Err(TransferError::Runtime(message));
    }
    if kind.reports_progress() {
        if let (Some(completed_bytes), Some(total_bytes)) = (line.completed, line.total) {
            return Ok(Some(TransferEvent::Progress {
                completed_bytes,
                total_bytes,
            }));
        }
    }
    Ok(line.status.map(|text| TransferEvent::Status { text }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_take_precedence_over_status() {
        let event = translate(
            TransferKind::Pull,
            br#"{"status":"downloading","digest":"sha256:aa","total":1000,"completed":250}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            Some(TransferEvent::Progress {
                completed_bytes: 250,
                total_bytes: 1000
            })
        );
    }

    #[test]
    fn import_only_reports_status() {
        let event = translate(
            TransferKind::Import,
            br#"{"status":"copying file","total":10,"completed":5}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            Some(TransferEvent::Status {
                text: "copying file".into()
            })
        );
    }

    #[test]
    fn error_field_short_circuits() {
        let err = translate(
            TransferKind::Pull,
            br#"{"status":"downloading","total":1,"completed":1,"error":"model not found"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::Runtime(m) if m == "model not found"));
    }

    #[test]
    fn blank_and_empty_objects_emit_nothing() {
        assert_eq!(translate(TransferKind::Pull, b"  \r\n").unwrap(), None);
        assert_eq!(translate(TransferKind::Pull, b"{}\n").unwrap(), None);
        // Only one counter present is not progress.
        assert_eq!(
            translate(TransferKind::Pull, br#"{"total":5}"#).unwrap(),
            None
        );
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let err = translate(TransferKind::Pull, b"<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, TransferError::MalformedLine { .. }));
    }
}
