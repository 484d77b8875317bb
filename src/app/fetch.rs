const READY_STATE_SCRIPT: &str = "return document.readyState";
const SCROLL_HEIGHT_SCRIPT: &str = "return document.documentElement.scrollHeight";
const CLIENT_HEIGHT_SCRIPT: &str = "return document.documentElement.clientHeight";
const SCROLL_TO_BOTTOM_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight);";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The slice of a browser session the fetch workflow needs: navigation,
/// synchronous script execution, and rendered source retrieval.
trait BrowserClient {
    async fn navigate(&self, url: &str) -> Result<(), WdError>;
    async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value, WdError>;
    async fn page_source(&self) -> Result<String, WdError>;
}

impl BrowserClient for WebDriverSession {
    async fn navigate(&self, url: &str) -> Result<(), WdError> {
        WebDriverSession::navigate(self, url).await
    }

    async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value, WdError> {
        WebDriverSession::execute(self, script, args).await
    }

    async fn page_source(&self) -> Result<String, WdError> {
        WebDriverSession::page_source(self).await
    }
}

fn classify_wd_error(err: WdError) -> FetchFailure {
    match &err {
        WdError::Protocol { name, .. } if name == "timeout" || name == "script timeout" => {
            FetchFailure::Timeout
        }
        WdError::Protocol { name, .. }
            if name == "no such element" || name == "no such window" =>
        {
            FetchFailure::ElementNotFound
        }
        _ => FetchFailure::Other(err.to_string()),
    }
}

/// Poll the document ready-state until it reports "complete" or the deadline
/// elapses.
async fn wait_until_ready<C: BrowserClient>(
    browser: &C,
    timeout: Duration,
) -> Result<(), FetchFailure> {
    let deadline = Instant::now() + timeout;
    loop {
        let state = browser
            .execute(READY_STATE_SCRIPT, Vec::new())
            .await
            .map_err(classify_wd_error)?;
        if state.as_str() == Some("complete") {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(FetchFailure::Timeout);
        }
        tokio::time::sleep(READY_POLL_INTERVAL.min(deadline - now)).await;
    }
}

async fn measured_height<C: BrowserClient>(browser: &C, script: &str) -> Result<i64, WdError> {
    let value = browser.execute(script, Vec::new()).await?;
    value.as_i64().ok_or_else(|| {
        WdError::Driver(format!("height script returned a non-integer: {value}"))
    })
}

/// Whether the page overflows its viewport vertically. Equal heights mean no
/// scrollbar.
async fn is_scrollable<C: BrowserClient>(browser: &C) -> Result<bool, WdError> {
    let scroll_height = measured_height(browser, SCROLL_HEIGHT_SCRIPT).await?;
    let viewport_height = measured_height(browser, CLIENT_HEIGHT_SCRIPT).await?;
    Ok(scroll_height > viewport_height)
}

/// Shared tail of both fetch flows: readiness wait, challenge pause,
/// conditional scroll to trigger lazy content, settle pause, source grab.
async fn grab_rendered_source<C: BrowserClient>(
    browser: &C,
    delays: &FetchDelays,
) -> Result<String, FetchFailure> {
    wait_until_ready(browser, delays.ready_timeout).await?;
    // anti-bot challenges render on their own schedule after load completes
    tokio::time::sleep(delays.challenge).await;
    if is_scrollable(browser).await.map_err(classify_wd_error)? {
        browser
            .execute(SCROLL_TO_BOTTOM_SCRIPT, Vec::new())
            .await
            .map_err(classify_wd_error)?;
    }
    tokio::time::sleep(delays.settle).await;
    browser.page_source().await.map_err(classify_wd_error)
}

/// Navigate to `url` and grab its rendered source. Never fails outright:
/// every attempt produces a result record with the outcome encoded in-band.
async fn fetch_page<C: BrowserClient>(
    browser: &C,
    url: &str,
    gambling_site: bool,
    delays: &FetchDelays,
) -> FetchResult {
    let outcome = async {
        browser.navigate(url).await.map_err(classify_wd_error)?;
        grab_rendered_source(browser, delays).await
    }
    .await;

    match outcome {
        Ok(html) => FetchResult::success(url, gambling_site, html),
        Err(failure) => FetchResult::failure(url, gambling_site, failure),
    }
}

/// Crawling variant: the session is already on the page, so no navigation
/// happens; a vanished element or window classifies as ElementNotFound.
async fn snapshot_page<C: BrowserClient>(
    browser: &C,
    url: &str,
    gambling_site: bool,
    delays: &FetchDelays,
) -> FetchResult {
    match grab_rendered_source(browser, delays).await {
        Ok(html) => FetchResult::success(url, gambling_site, html),
        Err(failure) => FetchResult::failure(url, gambling_site, failure),
    }
}

/// Fetch every target sequentially on one session, reporting each result over
/// the event channel as it completes.
async fn run_batch<C: BrowserClient>(
    browser: &C,
    targets: Vec<FetchTarget>,
    delays: FetchDelays,
    tx: UnboundedSender<FetchEvent>,
) {
    let total = targets.len();
    for (idx, target) in targets.into_iter().enumerate() {
        let result = fetch_page(browser, &target.url, target.gambling_site, &delays).await;
        match &result.error {
            None => info!("[{}/{}] fetched {}", idx + 1, total, result.url),
            Some(failure) => warn!("[{}/{}] failed {}: {}", idx + 1, total, result.url, failure),
        }
        let _ = tx.send(FetchEvent::Result(result));
    }
    let _ = tx.send(FetchEvent::Finished);
}
