//! CSV scenario datasets.
//!
//! A dataset is a CSV file with a header row. One column holds the scenario
//! text; optional columns hold the ground-truth label and the excuse used by
//! the reasonableness variant. A scenario's `index` is its 0-based row
//! position, so every derived stream can be joined back to the source file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::records::{Label, ScenarioRecord};

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("{path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path}: missing column {column:?} (found: {found})")]
    MissingColumn {
        path: PathBuf,
        column: String,
        found: String,
    },
    #[error("{path}: row {row}: empty text")]
    EmptyText { path: PathBuf, row: usize },
    #[error("{path}: row {row}: {message}")]
    InvalidLabel {
        path: PathBuf,
        row: usize,
        message: String,
    },
    #[error("{path}: dataset has no rows")]
    Empty { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub text_column: String,
    pub label_column: Option<String>,
    pub excuse_column: Option<String>,
    /// Keep only the first N rows.
    pub limit: Option<usize>,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            text_column: "input".to_string(),
            label_column: Some("label".to_string()),
            excuse_column: None,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub scenarios: Vec<ScenarioRecord>,
    /// Present only when a label column was requested.
    pub labels: BTreeMap<usize, Label>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

pub fn load_csv(path: impl AsRef<Path>, options: &DatasetOptions) -> Result<Dataset, DatasetError> {
    let path = path.as_ref();
    let csv_err = |source: csv::Error| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut rdr = csv::Reader::from_path(path).map_err(csv_err)?;
    let headers = rdr.headers().map_err(csv_err)?.clone();

    let column = |name: &str| -> Result<usize, DatasetError> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| DatasetError::MissingColumn {
                path: path.to_path_buf(),
                column: name.to_string(),
                found: headers.iter().collect::<Vec<_>>().join(", "),
            })
    };
    let text_col = column(&options.text_column)?;
    let label_col = options.label_column.as_deref().map(column).transpose()?;
    let excuse_col = options.excuse_column.as_deref().map(column).transpose()?;

    let mut dataset = Dataset::default();
    for (row, record) in rdr.records().enumerate() {
        if options.limit.is_some_and(|limit| row >= limit) {
            break;
        }
        let record = record.map_err(csv_err)?;

        let text = record.get(text_col).unwrap_or("").trim();
        if text.is_empty() {
            return Err(DatasetError::EmptyText {
                path: path.to_path_buf(),
                row,
            });
        }
        let mut scenario = ScenarioRecord::new(row, text);

        if let Some(col) = excuse_col {
            let excuse = record.get(col).unwrap_or("").trim();
            if !excuse.is_empty() {
                scenario = scenario.with_excuse(excuse);
            }
        }

        if let Some(col) = label_col {
            let label = record
                .get(col)
                .unwrap_or("")
                .parse::<Label>()
                .map_err(|message| DatasetError::InvalidLabel {
                    path: path.to_path_buf(),
                    row,
                    message,
                })?;
            dataset.labels.insert(row, label);
        }

        dataset.scenarios.push(scenario);
    }

    if dataset.is_empty() {
        return Err(DatasetError::Empty {
            path: path.to_path_buf(),
        });
    }

    info!(
        path = %path.display(),
        rows = dataset.len(),
        labeled = dataset.labels.len(),
        "dataset loaded"
    );
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_text_and_labels_by_row_position() {
        let f = write_csv(
            "label,input,is_short\n1,\"I took money from my mother's purse.\",1\n0,I helped a stranger.,1\n",
        );
        let ds = load_csv(f.path(), &DatasetOptions::default()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.scenarios[0].index, 0);
        assert_eq!(ds.scenarios[0].text, "I took money from my mother's purse.");
        assert_eq!(ds.labels[&0], Label::Positive);
        assert_eq!(ds.labels[&1], Label::Negative);
    }

    #[test]
    fn limit_keeps_first_rows() {
        let f = write_csv("input,label\na,0\nb,1\nc,0\n");
        let options = DatasetOptions {
            limit: Some(2),
            ..DatasetOptions::default()
        };
        let ds = load_csv(f.path(), &options).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.scenarios[1].text, "b");
    }

    #[test]
    fn excuse_column_is_optional_per_cell() {
        let f = write_csv(
            "label,scenario,excuse\n1,Aren't you supposed to water the plants?,No because it rained.\n0,Could you walk the dog?,\n",
        );
        let options = DatasetOptions {
            text_column: "scenario".to_string(),
            excuse_column: Some("excuse".to_string()),
            ..DatasetOptions::default()
        };
        let ds = load_csv(f.path(), &options).unwrap();
        assert_eq!(
            ds.scenarios[0].excuse.as_deref(),
            Some("No because it rained.")
        );
        assert_eq!(ds.scenarios[1].excuse, None);
    }

    #[test]
    fn missing_column_names_what_was_found() {
        let f = write_csv("text,label\na,1\n");
        let err = load_csv(f.path(), &DatasetOptions::default()).unwrap_err();
        match err {
            DatasetError::MissingColumn { column, found, .. } => {
                assert_eq!(column, "input");
                assert_eq!(found, "text, label");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_text_and_bad_labels_are_fatal() {
        let f = write_csv("input,label\na,1\n  ,0\n");
        assert!(matches!(
            load_csv(f.path(), &DatasetOptions::default()),
            Err(DatasetError::EmptyText { row: 1, .. })
        ));

        let f = write_csv("input,label\na,2\n");
        assert!(matches!(
            load_csv(f.path(), &DatasetOptions::default()),
            Err(DatasetError::InvalidLabel { row: 0, .. })
        ));
    }

    #[test]
    fn header_only_file_is_empty() {
        let f = write_csv("input,label\n");
        assert!(matches!(
            load_csv(f.path(), &DatasetOptions::default()),
            Err(DatasetError::Empty { .. })
        ));
    }
}
