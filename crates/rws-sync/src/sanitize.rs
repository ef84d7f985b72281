//! Header normalization. Only the first line is rewritten; row bytes pass through untouched.

use std::collections::HashSet;

use csv::ReaderBuilder;
use rws_core::{underscore_whitespace, PipelineError};
use rws_storage::{ScratchArtifact, ScratchSpace};
use uuid::Uuid;

/// Replace each whitespace run in a header line with a single underscore.
pub fn sanitize_header(header: &str) -> String {
    underscore_whitespace(header)
}

/// Byte offset where the header ends; a `\r` before the first `\n` belongs to the terminator.
fn header_end(raw: &[u8]) -> Option<usize> {
    let newline = raw.iter().position(|&b| b == b'\n')?;
    if newline > 0 && raw[newline - 1] == b'\r' {
        Some(newline - 1)
    } else {
        Some(newline)
    }
}

/// Sanitize the header of the dataset extracted for `table`.
///
/// A dataset without any line terminator is empty. The header must be UTF-8; row bytes are
/// never decoded.
pub fn sanitize_dataset(raw: &[u8], table: &str) -> Result<Vec<u8>, PipelineError> {
    let end = header_end(raw).ok_or_else(|| PipelineError::EmptyDataset {
        report: table.to_string(),
    })?;
    let header = std::str::from_utf8(&raw[..end]).map_err(|e| {
        PipelineError::SchemaMismatch {
            table: table.to_string(),
            message: format!("header is not valid UTF-8: {e}"),
        }
    })?;
    let mut out = sanitize_header(header).into_bytes();
    out.extend_from_slice(&raw[end..]);
    Ok(out)
}

/// Field names of a sanitized header, rejecting blanks and duplicates.
pub fn header_fields(sanitized: &[u8], table: &str) -> Result<Vec<String>, PipelineError> {
    let mismatch = |message: String| PipelineError::SchemaMismatch {
        table: table.to_string(),
        message,
    };

    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(sanitized);
    let headers = reader
        .headers()
        .map_err(|e| mismatch(format!("unreadable header: {e}")))?;

    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(headers.len());
    for field in headers.iter() {
        if field.is_empty() {
            return Err(mismatch("header has an empty field name".to_string()));
        }
        if !seen.insert(field.to_string()) {
            return Err(mismatch(format!(
                "field {field:?} appears more than once after sanitization"
            )));
        }
        fields.push(field.to_string());
    }
    Ok(fields)
}

pub struct Sanitizer<'a> {
    scratch: &'a ScratchSpace,
}

impl<'a> Sanitizer<'a> {
    pub fn new(scratch: &'a ScratchSpace) -> Self {
        Self { scratch }
    }

    /// Write the sanitized dataset into a fresh artifact owned by `run_id`.
    pub async fn sanitize_to_artifact(
        &self,
        run_id: Uuid,
        label: &str,
        raw: &[u8],
    ) -> Result<ScratchArtifact, PipelineError> {
        let sanitized = sanitize_dataset(raw, label)?;
        header_fields(&sanitized, label)?;

        let mut artifact = self
            .scratch
            .acquire(run_id, label)
            .map_err(|e| scratch_failure("acquiring scratch artifact", e))?;
        artifact
            .write_bytes(&sanitized)
            .await
            .map_err(|e| scratch_failure("writing scratch artifact", e))?;
        Ok(artifact)
    }
}

pub(crate) fn scratch_failure(operation: &str, err: anyhow::Error) -> PipelineError {
    PipelineError::TransientIo {
        operation: operation.to_string(),
        message: format!("{err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn header_spaces_become_underscores() {
        assert_eq!(
            sanitize_dataset(b"User ID,Amount Paid\n1, 2 3\n", "t").unwrap(),
            b"User_ID,Amount_Paid\n1, 2 3\n"
        );
    }

    #[test]
    fn whitespace_runs_collapse_and_crlf_is_kept() {
        assert_eq!(
            sanitize_dataset(b"Order \t Date,Net  Total\r\na b,c\r\n", "t").unwrap(),
            b"Order_Date,Net_Total\r\na b,c\r\n"
        );
    }

    #[test]
    fn sanitizing_twice_changes_nothing() {
        let samples: [&[u8]; 4] = [
            b"User ID,Amount Paid\n1,2\n",
            b" leading,trailing \nx\n",
            b"a\tb,c\x0bd\n",
            b"\n",
        ];
        for raw in samples {
            let once = sanitize_dataset(raw, "t").unwrap();
            let twice = sanitize_dataset(&once, "t").unwrap();
            assert_eq!(once, twice);
            let end = header_end(&once).unwrap();
            assert!(!String::from_utf8_lossy(&once[..end])
                .chars()
                .any(char::is_whitespace));
        }
    }

    #[test]
    fn data_after_first_terminator_is_byte_identical() {
        let raw: &[u8] = b"A B,C D\n  spaced  value ,\xff\xfe raw\n\nlast";
        let out = sanitize_dataset(raw, "t").unwrap();
        let raw_rest = &raw[header_end(raw).unwrap()..];
        let out_rest = &out[header_end(&out).unwrap()..];
        assert_eq!(raw_rest, out_rest);
    }

    #[test]
    fn no_terminator_means_no_dataset() {
        for raw in [&b"Unique_ID,Col1"[..], &b""[..]] {
            assert_eq!(
                sanitize_dataset(raw, "t"),
                Err(PipelineError::EmptyDataset { report: "t".into() })
            );
        }
    }

    #[test]
    fn undecodable_header_is_rejected_instead_of_rewritten() {
        let err = sanitize_dataset(b"Unique_ID,Caf\xe9 Name\n1,a\n", "t").unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { table, .. } if table == "t"));
    }

    #[test]
    fn colliding_fields_are_a_schema_mismatch() {
        let sanitized = sanitize_dataset(b"User ID,User_ID\n1,2\n", "users").unwrap();
        let err = header_fields(&sanitized, "users").unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { .. }));
        assert_eq!(
            header_fields(b"Unique_ID,Col1\n1,a\n", "t").unwrap(),
            vec!["Unique_ID".to_string(), "Col1".to_string()]
        );
    }

    #[tokio::test]
    async fn artifact_holds_the_sanitized_dataset() {
        let dir = tempdir().expect("tempdir");
        let scratch = ScratchSpace::new(dir.path());
        let artifact = Sanitizer::new(&scratch)
            .sanitize_to_artifact(Uuid::new_v4(), "saved_look_1", b"Unique ID,Col 1\n1,a b\n")
            .await
            .unwrap();
        assert_eq!(
            artifact.read_bytes().await.unwrap(),
            b"Unique_ID,Col_1\n1,a b\n"
        );
        artifact.release().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
