const CSV_HEADERS: [&str; 7] = [
    "url",
    "is_gambling_site",
    "is_error",
    "error",
    "title",
    "html_bytes",
    "fetched_at",
];

/// Flat view of a `FetchResult` for export. The HTML itself only travels in
/// JSON output; CSV rows carry its length and extracted title instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExportRecord {
    url: String,
    is_gambling_site: bool,
    is_error: bool,
    error: Option<String>,
    title: String,
    html_bytes: usize,
    fetched_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    html: Option<String>,
}

fn result_to_export_record(result: &FetchResult) -> ExportRecord {
    let title = result
        .html
        .as_deref()
        .map(page_title)
        .unwrap_or_default();
    ExportRecord {
        url: result.url.clone(),
        is_gambling_site: result.gambling_site,
        is_error: result.is_error(),
        error: result.error.as_ref().map(|e| e.to_string()),
        title,
        html_bytes: result.html.as_ref().map(|h| h.len()).unwrap_or(0),
        fetched_at: result.fetched_at.to_rfc3339(),
        html: result.html.clone(),
    }
}

/// Extract the document title from rendered HTML; empty when absent.
fn page_title(html: &str) -> String {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("title") else {
        return String::new();
    };
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    fn new(output_path: &str) -> io::Result<Self> {
        let file = File::create(output_path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(CSV_HEADERS)?;
        Ok(Self { writer })
    }

    fn write_result(&mut self, result: &FetchResult) -> io::Result<()> {
        let rec = result_to_export_record(result);
        self.writer.write_record([
            rec.url,
            rec.is_gambling_site.to_string(),
            rec.is_error.to_string(),
            rec.error.unwrap_or_default(),
            rec.title,
            rec.html_bytes.to_string(),
            rec.fetched_at,
        ])?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

struct JsonSink {
    file: File,
    first: bool,
    closed: bool,
}

impl JsonSink {
    fn new(output_path: &str) -> io::Result<Self> {
        let mut file = File::create(output_path)?;
        file.write_all(b"[\n")?;
        Ok(Self {
            file,
            first: true,
            closed: false,
        })
    }

    fn write_result(&mut self, result: &FetchResult) -> io::Result<()> {
        let rec = result_to_export_record(result);
        if !self.first {
            self.file.write_all(b",\n")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.file, &rec).map_err(io::Error::other)?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn finalize(&mut self) -> io::Result<()> {
        if !self.closed {
            if self.first {
                self.file.write_all(b"]\n")?;
            } else {
                self.file.write_all(b"\n]\n")?;
            }
            self.closed = true;
        }
        self.file.flush()
    }
}

impl Drop for JsonSink {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

enum OutputSink {
    Csv(CsvSink),
    Json(JsonSink),
}

impl OutputSink {
    fn new(output_path: &str, format: DataFormat) -> io::Result<Self> {
        match format {
            DataFormat::Csv => Ok(OutputSink::Csv(CsvSink::new(output_path)?)),
            DataFormat::Json => Ok(OutputSink::Json(JsonSink::new(output_path)?)),
        }
    }

    fn write_result(&mut self, result: &FetchResult) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.write_result(result),
            OutputSink::Json(sink) => sink.write_result(result),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.flush(),
            OutputSink::Json(sink) => sink.flush(),
        }
    }

    fn finalize(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.flush(),
            OutputSink::Json(sink) => sink.finalize(),
        }
    }
}

fn detect_data_format(path: &str, fallback: DataFormat) -> DataFormat {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        DataFormat::Json
    } else if lower.ends_with(".csv") {
        DataFormat::Csv
    } else {
        fallback
    }
}

fn default_output_path(input_label: &str, format: DataFormat) -> String {
    let stem = Path::new(input_label)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("sweep");
    let stem = stem
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    match format {
        DataFormat::Csv => format!("{stem}_{ts}.csv"),
        DataFormat::Json => format!("{stem}_{ts}.json"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TargetEntry {
    Url(String),
    Record {
        url: String,
        #[serde(default)]
        is_gambling_site: bool,
    },
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

fn load_targets_from_csv(path: &str, default_flag: bool) -> io::Result<Vec<FetchTarget>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let mut url_idx = None;
    let mut flag_idx = None;
    for (idx, header) in headers.iter().enumerate() {
        match header.trim().to_ascii_lowercase().as_str() {
            "url" | "web_url" => url_idx = Some(idx),
            "is_gambling_site" | "gambling" => flag_idx = Some(idx),
            _ => {}
        }
    }
    let url_idx = url_idx.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "CSV input has no url column")
    })?;

    let mut targets = Vec::new();
    for record in reader.records() {
        let record = record?;
        let Some(url) = record.get(url_idx).map(str::trim) else {
            continue;
        };
        if url.is_empty() {
            continue;
        }
        let gambling_site = flag_idx
            .and_then(|idx| record.get(idx))
            .map(parse_flag)
            .unwrap_or(default_flag);
        targets.push(FetchTarget {
            url: url.to_string(),
            gambling_site,
        });
    }
    Ok(targets)
}

fn load_targets_from_json(path: &str, default_flag: bool) -> io::Result<Vec<FetchTarget>> {
    let content = fs::read_to_string(path)?;
    let entries: Vec<TargetEntry> = serde_json::from_str(&content)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            TargetEntry::Url(url) => FetchTarget {
                url,
                gambling_site: default_flag,
            },
            TargetEntry::Record {
                url,
                is_gambling_site,
            } => FetchTarget {
                url,
                gambling_site: is_gambling_site,
            },
        })
        .filter(|t| !t.url.trim().is_empty())
        .collect())
}

fn load_targets_from_text(path: &str, default_flag: bool) -> io::Result<Vec<FetchTarget>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| FetchTarget {
            url: line.to_string(),
            gambling_site: default_flag,
        })
        .collect())
}

/// Load fetch targets from a CSV, JSON, or plain-text URL list; entries
/// without their own classification inherit `default_flag`.
fn load_targets_from_file(path: &str, default_flag: bool) -> io::Result<Vec<FetchTarget>> {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".csv") {
        load_targets_from_csv(path, default_flag)
    } else if lower.ends_with(".json") {
        load_targets_from_json(path, default_flag)
    } else {
        load_targets_from_text(path, default_flag)
    }
}

#[cfg(test)]
mod data_io_tests {
    use super::*;

    fn sample_success() -> FetchResult {
        FetchResult::success(
            "https://example.com",
            true,
            "<html><head><title> Example Domain </title></head></html>".to_string(),
        )
    }

    #[test]
    fn export_record_reflects_result_fields() {
        let rec = result_to_export_record(&sample_success());
        assert_eq!(rec.url, "https://example.com");
        assert!(rec.is_gambling_site);
        assert!(!rec.is_error);
        assert_eq!(rec.error, None);
        assert_eq!(rec.title, "Example Domain");
        assert!(rec.html_bytes > 0);
        assert!(rec.html.is_some());
    }

    #[test]
    fn export_record_for_failure_has_no_html() {
        let result = FetchResult::failure("https://down.example", false, FetchFailure::Timeout);
        let rec = result_to_export_record(&result);
        assert!(rec.is_error);
        assert_eq!(rec.error.as_deref(), Some("Timeout"));
        assert_eq!(rec.html_bytes, 0);
        assert!(rec.html.is_none());
        assert_eq!(rec.title, "");
    }

    #[test]
    fn page_title_handles_missing_title() {
        assert_eq!(page_title("<html><body>no title</body></html>"), "");
        assert_eq!(page_title("<title>hi</title>"), "hi");
    }

    #[test]
    fn csv_sink_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let path = path.to_str().unwrap();
        let mut sink = CsvSink::new(path).unwrap();
        sink.write_result(&sample_success()).unwrap();
        sink.flush().unwrap();

        let content = fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "url,is_gambling_site,is_error,error,title,html_bytes,fetched_at"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("https://example.com,true,false,,Example Domain,"));
    }

    #[test]
    fn json_sink_produces_parseable_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let path = path.to_str().unwrap();
        let mut sink = JsonSink::new(path).unwrap();
        sink.write_result(&sample_success()).unwrap();
        sink.write_result(&FetchResult::failure(
            "https://down.example",
            false,
            FetchFailure::Other("connection refused".to_string()),
        ))
        .unwrap();
        sink.finalize().unwrap();

        let content = fs::read_to_string(path).unwrap();
        let records: Vec<ExportRecord> = serde_json::from_str(&content).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].html.is_some());
        assert_eq!(records[1].error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn text_list_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        fs::write(&path, "# header\nhttps://a.example\n\nhttps://b.example\n").unwrap();
        let targets = load_targets_from_file(path.to_str().unwrap(), true).unwrap();
        assert_eq!(
            targets,
            vec![
                FetchTarget {
                    url: "https://a.example".to_string(),
                    gambling_site: true,
                },
                FetchTarget {
                    url: "https://b.example".to_string(),
                    gambling_site: true,
                },
            ]
        );
    }

    #[test]
    fn csv_list_reads_url_and_flag_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.csv");
        fs::write(
            &path,
            "web_url,is_gambling_site\nhttps://a.example,true\nhttps://b.example,false\n",
        )
        .unwrap();
        let targets = load_targets_from_file(path.to_str().unwrap(), false).unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets[0].gambling_site);
        assert!(!targets[1].gambling_site);
    }

    #[test]
    fn csv_list_without_url_column_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.csv");
        fs::write(&path, "name\nfoo\n").unwrap();
        assert!(load_targets_from_file(path.to_str().unwrap(), false).is_err());
    }

    #[test]
    fn json_list_accepts_strings_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");
        fs::write(
            &path,
            r#"["https://a.example", {"url": "https://b.example", "is_gambling_site": true}]"#,
        )
        .unwrap();
        let targets = load_targets_from_file(path.to_str().unwrap(), false).unwrap();
        assert_eq!(targets.len(), 2);
        assert!(!targets[0].gambling_site);
        assert!(targets[1].gambling_site);
    }

    #[test]
    fn format_detection_prefers_extension() {
        assert_eq!(
            detect_data_format("out.json", DataFormat::Csv),
            DataFormat::Json
        );
        assert_eq!(
            detect_data_format("out.csv", DataFormat::Json),
            DataFormat::Csv
        );
        assert_eq!(
            detect_data_format("out.dat", DataFormat::Json),
            DataFormat::Json
        );
    }

    #[test]
    fn default_output_path_sanitizes_label() {
        let path = default_output_path("suspect list!.txt", DataFormat::Csv);
        assert!(path.starts_with("suspect_list_"));
        assert!(path.ends_with(".csv"));
    }
}
