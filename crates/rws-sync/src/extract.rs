//! Resolve a report name to one identifier and fetch its rendered rows.

use std::time::Duration;

use rws_adapters::{ReportId, ReportSource, ResultFormat, SourceError};
use rws_core::PipelineError;
use tracing::{info, warn};

use crate::bounded;
use crate::config::AmbiguityPolicy;

#[derive(Debug, Clone)]
pub struct ExtractedReport {
    pub report_id: ReportId,
    /// How many identifiers the name resolved to before one was chosen.
    pub matches: usize,
    pub body: Vec<u8>,
}

pub struct Extractor<'a> {
    source: &'a dyn ReportSource,
    ambiguity: AmbiguityPolicy,
    timeout: Duration,
}

impl<'a> Extractor<'a> {
    pub fn new(
        source: &'a dyn ReportSource,
        ambiguity: AmbiguityPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            ambiguity,
            timeout,
        }
    }

    pub async fn extract(&self, report_name: &str) -> Result<ExtractedReport, PipelineError> {
        if report_name.trim().is_empty() {
            return Err(PipelineError::FatalConfig(
                "report name must not be empty".to_string(),
            ));
        }

        let ids = bounded(self.timeout, "report search", async {
            self.source
                .search(report_name)
                .await
                .map_err(|e| source_failure("report search", report_name, e))
        })
        .await?;

        let report_id = match ids.as_slice() {
            [] => {
                return Err(PipelineError::NotFound {
                    report: report_name.to_string(),
                })
            }
            [only] => only.clone(),
            [first, ..] => match self.ambiguity {
                AmbiguityPolicy::First => {
                    warn!(
                        report = report_name,
                        matches = ids.len(),
                        chosen = %first,
                        "report name is ambiguous; using the first match"
                    );
                    first.clone()
                }
                AmbiguityPolicy::Reject => {
                    return Err(PipelineError::AmbiguousMatch {
                        report: report_name.to_string(),
                        count: ids.len(),
                    })
                }
            },
        };

        let body = bounded(self.timeout, "report run", async {
            self.source
                .run(&report_id, ResultFormat::Csv)
                .await
                .map_err(|e| source_failure("report run", report_name, e))
        })
        .await?;

        if !body.contains(&b'\n') {
            return Err(PipelineError::EmptyDataset {
                report: report_name.to_string(),
            });
        }

        info!(
            report = report_name,
            report_id = %report_id,
            bytes = body.len(),
            "extracted report"
        );
        Ok(ExtractedReport {
            report_id,
            matches: ids.len(),
            body,
        })
    }
}

fn source_failure(operation: &str, report: &str, err: SourceError) -> PipelineError {
    match err {
        SourceError::Transport(message) => PipelineError::TransientIo {
            operation: operation.to_string(),
            message,
        },
        SourceError::Auth(message) => PipelineError::FatalConfig(format!(
            "reporting source refused credentials during {operation}: {message}"
        )),
        SourceError::Rejected(message) => PipelineError::FatalConfig(format!(
            "reporting source rejected {operation} for {report:?}: {message}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rws_adapters::StaticReportSource;

    fn extractor(source: &StaticReportSource, ambiguity: AmbiguityPolicy) -> Extractor<'_> {
        Extractor::new(source, ambiguity, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn single_match_is_fetched() {
        let source = StaticReportSource::new().with_report("Saved Look 1", "7", "a,b\n1,2\n");
        let report = extractor(&source, AmbiguityPolicy::First)
            .extract("Saved Look 1")
            .await
            .unwrap();
        assert_eq!(report.report_id, ReportId::new("7"));
        assert_eq!(report.matches, 1);
        assert_eq!(report.body, b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn ambiguous_names_pick_the_first_match_or_fail_when_strict() {
        let source = StaticReportSource::new()
            .with_report("Dup", "1", "first\n")
            .with_report("Dup", "2", "second\n");

        let report = extractor(&source, AmbiguityPolicy::First)
            .extract("Dup")
            .await
            .unwrap();
        assert_eq!(report.body, b"first\n");
        assert_eq!(report.matches, 2);

        let err = extractor(&source, AmbiguityPolicy::Reject)
            .extract("Dup")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::AmbiguousMatch {
                report: "Dup".into(),
                count: 2
            }
        );
    }

    #[tokio::test]
    async fn missing_and_empty_reports_fail() {
        let source = StaticReportSource::new().with_report("No Rows", "3", "Unique_ID,Col1");
        let err = extractor(&source, AmbiguityPolicy::First)
            .extract("Unknown")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));

        let err = extractor(&source, AmbiguityPolicy::First)
            .extract("No Rows")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyDataset { .. }));

        let err = extractor(&source, AmbiguityPolicy::First)
            .extract(" ")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::FatalConfig(_)));
    }

    #[tokio::test]
    async fn transport_failures_are_transient() {
        let source = StaticReportSource::new()
            .with_report("Flaky", "9", "a\n1\n")
            .with_run_failure("9", SourceError::Transport("connection reset".into()));
        let err = extractor(&source, AmbiguityPolicy::First)
            .extract("Flaky")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
