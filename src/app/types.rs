#[derive(Debug, Parser, Clone)]
#[command(
    name = "sitesweep",
    version,
    about = "Batch WebDriver page fetcher with live CSV/JSON result reports"
)]
struct Cli {
    #[arg(value_name = "FILE", required_unless_present = "url")]
    targets: Option<String>,

    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Classification applied to --url and to list entries without their own flag.
    #[arg(long, default_value_t = false)]
    gambling: bool,

    #[arg(short, long, value_name = "FILE")]
    output: Option<String>,

    #[arg(long, value_enum, default_value_t = FileFormatArg::Csv)]
    format: FileFormatArg,

    #[arg(long, value_name = "URL", default_value = "http://localhost:4444")]
    webdriver_url: String,

    #[arg(long, value_name = "PATH")]
    webdriver_binary: Option<String>,

    #[arg(long, default_value_t = false)]
    no_webdriver_autostart: bool,

    #[arg(long, value_name = "MS", default_value_t = 12000)]
    webdriver_start_timeout_ms: u64,

    #[arg(long, value_enum, default_value_t = BrowserArg::Chrome)]
    browser: BrowserArg,

    #[arg(long, default_value_t = false)]
    headless: bool,

    /// Unpacked ad-block extension directory to load into the browser profile.
    #[arg(long, value_name = "DIR")]
    adblock_extension: Option<String>,

    #[arg(long, value_name = "SECS", default_value_t = 30)]
    ready_timeout_secs: u64,

    #[arg(long, value_name = "SECS", default_value_t = 5)]
    challenge_delay_secs: u64,

    #[arg(long, value_name = "SECS", default_value_t = 5)]
    settle_delay_secs: u64,

    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
enum BrowserArg {
    Chrome,
    Firefox,
    Edge,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
enum FileFormatArg {
    Csv,
    Json,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DataFormat {
    Csv,
    Json,
}

impl From<FileFormatArg> for DataFormat {
    fn from(value: FileFormatArg) -> Self {
        match value {
            FileFormatArg::Csv => DataFormat::Csv,
            FileFormatArg::Json => DataFormat::Json,
        }
    }
}

/// One page to fetch, with its caller-supplied classification.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FetchTarget {
    url: String,
    gambling_site: bool,
}

/// Failure classification for a single fetch attempt. The original driver
/// message is kept as data in the `Other` case.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
enum FetchFailure {
    #[error("Timeout")]
    Timeout,
    #[error("ElementNotFound")]
    ElementNotFound,
    #[error("{0}")]
    Other(String),
}

/// Outcome record of one fetch attempt. Built once at the end of the attempt
/// and immutable afterwards; `error.is_none()` iff `html.is_some()`.
#[derive(Debug, Clone)]
struct FetchResult {
    url: String,
    gambling_site: bool,
    html: Option<String>,
    error: Option<FetchFailure>,
    fetched_at: DateTime<Utc>,
}

impl FetchResult {
    fn success(url: impl Into<String>, gambling_site: bool, html: String) -> Self {
        Self {
            url: url.into(),
            gambling_site,
            html: Some(html),
            error: None,
            fetched_at: Utc::now(),
        }
    }

    fn failure(url: impl Into<String>, gambling_site: bool, error: FetchFailure) -> Self {
        Self {
            url: url.into(),
            gambling_site,
            html: None,
            error: Some(error),
            fetched_at: Utc::now(),
        }
    }

    fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Wait and pause knobs for the fetch workflow. The two fixed pauses are
/// load-timing heuristics, not correctness guarantees.
#[derive(Debug, Clone, Copy)]
struct FetchDelays {
    ready_timeout: Duration,
    challenge: Duration,
    settle: Duration,
}

impl Default for FetchDelays {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30),
            challenge: Duration::from_secs(5),
            settle: Duration::from_secs(5),
        }
    }
}

impl From<&Cli> for FetchDelays {
    fn from(cli: &Cli) -> Self {
        Self {
            ready_timeout: Duration::from_secs(cli.ready_timeout_secs),
            challenge: Duration::from_secs(cli.challenge_delay_secs),
            settle: Duration::from_secs(cli.settle_delay_secs),
        }
    }
}

#[derive(Debug)]
enum FetchEvent {
    Result(FetchResult),
    Finished,
}

#[derive(Debug, Default)]
struct RunStats {
    fetched: usize,
    failed: usize,
}

impl RunStats {
    fn record(&mut self, result: &FetchResult) {
        if result.is_error() {
            self.failed += 1;
        } else {
            self.fetched += 1;
        }
    }

    fn total(&self) -> usize {
        self.fetched + self.failed
    }
}
