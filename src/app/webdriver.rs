#[derive(Debug, Error)]
enum WdError {
    #[error("webdriver transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{name}: {message}")]
    Protocol { name: String, message: String },
    #[error("{0}")]
    Driver(String),
}

/// Decode a WebDriver HTTP response body, surfacing protocol-level errors
/// reported under `/value/error`.
fn wd_value(status: reqwest::StatusCode, body: &str) -> Result<Value, WdError> {
    let value: Value = serde_json::from_str(body).map_err(|e| {
        WdError::Driver(format!(
            "response parse failed: {e}; body={}",
            truncate_for_log(body, 220)
        ))
    })?;
    if let Some(name) = value.pointer("/value/error").and_then(|v| v.as_str()) {
        let message = value
            .pointer("/value/message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown webdriver error");
        return Err(WdError::Protocol {
            name: name.to_string(),
            message: message.to_string(),
        });
    }
    if !status.is_success() {
        return Err(WdError::Driver(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate_for_log(body, 260)
        )));
    }
    Ok(value)
}

/// A live W3C WebDriver session, driven over its HTTP endpoint.
#[derive(Debug)]
struct WebDriverSession {
    client: reqwest::Client,
    base: String,
    session_id: String,
}

impl WebDriverSession {
    async fn create(endpoint: &str, capabilities: &Value) -> Result<Self, WdError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()?;
        let base = endpoint.trim_end_matches('/').to_string();
        let res = client
            .post(format!("{base}/session"))
            .json(capabilities)
            .send()
            .await?;
        let status = res.status();
        let body = res.text().await?;
        let value = wd_value(status, &body)?;
        let session_id = value
            .pointer("/value/sessionId")
            .and_then(|v| v.as_str())
            .or_else(|| value.pointer("/sessionId").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .ok_or_else(|| {
                WdError::Driver(format!(
                    "session id missing in response: {}",
                    truncate_for_log(&body, 220)
                ))
            })?;
        Ok(Self {
            client,
            base,
            session_id,
        })
    }

    async fn command(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, WdError> {
        let url = format!("{}/session/{}{}", self.base, self.session_id, path);
        let mut req = self.client.request(method, url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let res = req.send().await?;
        let status = res.status();
        let text = res.text().await?;
        wd_value(status, &text)
    }

    async fn navigate(&self, url: &str) -> Result<(), WdError> {
        self.command(reqwest::Method::POST, "/url", Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value, WdError> {
        let value = self
            .command(
                reqwest::Method::POST,
                "/execute/sync",
                Some(json!({ "script": script, "args": args })),
            )
            .await?;
        Ok(value.pointer("/value").cloned().unwrap_or(Value::Null))
    }

    async fn page_source(&self) -> Result<String, WdError> {
        let value = self
            .command(reqwest::Method::GET, "/source", None)
            .await?;
        value
            .pointer("/value")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| WdError::Driver("page source missing in response".to_string()))
    }

    async fn window_handles(&self) -> Result<Vec<String>, WdError> {
        let value = self
            .command(reqwest::Method::GET, "/window/handles", None)
            .await?;
        Ok(value
            .pointer("/value")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|x| x.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default())
    }

    async fn switch_window(&self, handle: &str) -> Result<(), WdError> {
        self.command(
            reqwest::Method::POST,
            "/window",
            Some(json!({ "handle": handle })),
        )
        .await?;
        Ok(())
    }

    async fn close_window(&self) -> Result<(), WdError> {
        self.command(reqwest::Method::DELETE, "/window", None).await?;
        Ok(())
    }

    async fn quit(self) -> Result<(), WdError> {
        let url = format!("{}/session/{}", self.base, self.session_id);
        self.client.delete(url).send().await?;
        Ok(())
    }
}

fn webdriver_capabilities(
    browser: BrowserArg,
    headless: bool,
    adblock_extension: Option<&Path>,
) -> Value {
    match browser {
        BrowserArg::Firefox => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("-headless".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "acceptInsecureCerts": true,
                        "moz:firefoxOptions": { "args": args }
                    }
                }
            })
        }
        BrowserArg::Edge => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push("--disable-gpu".to_string());
            args.push("--mute-audio".to_string());
            args.push("--ignore-certificate-errors".to_string());
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "MicrosoftEdge",
                        "acceptInsecureCerts": true,
                        "ms:edgeOptions": { "args": args }
                    }
                }
            })
        }
        BrowserArg::Chrome => {
            let mut args = Vec::<String>::new();
            let profile_dir = std::env::temp_dir().join(format!(
                "sitesweep-chrome-profile-{}-{}",
                std::process::id(),
                Utc::now().timestamp_millis()
            ));
            let _ = fs::create_dir_all(&profile_dir);
            args.push(format!("--user-data-dir={}", profile_dir.display()));
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push("--disable-gpu".to_string());
            args.push("--mute-audio".to_string());
            args.push("--ignore-certificate-errors".to_string());
            args.push("--allow-insecure-localhost".to_string());
            args.push("--ignore-ssl-errors".to_string());
            args.push("--log-level=3".to_string());
            args.push("--disable-web-security".to_string());
            args.push("--no-first-run".to_string());
            args.push("--no-default-browser-check".to_string());
            if let Some(extension) = adblock_extension {
                args.push(format!("--load-extension={}", extension.display()));
            }
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "goog:chromeOptions": { "args": args }
                    }
                }
            })
        }
    }
}

/// Create a configured session; when an ad-block extension was loaded, its
/// auto-opened welcome tab is dismissed before the session is handed out.
async fn open_session(cli: &Cli, endpoint: &str) -> Result<WebDriverSession, WdError> {
    let extension = cli.adblock_extension.as_deref().map(Path::new);
    if extension.is_some() && cli.browser != BrowserArg::Chrome {
        warn!("ad-block extension loading is only wired up for chrome; ignoring it");
    }
    let caps = webdriver_capabilities(cli.browser, cli.headless, extension);
    let session = WebDriverSession::create(endpoint, &caps).await?;
    if extension.is_some() && cli.browser == BrowserArg::Chrome {
        if let Err(err) = dismiss_extension_welcome_tab(&session).await {
            warn!("extension welcome tab cleanup failed: {err}");
        }
    }
    Ok(session)
}

const WELCOME_TAB_TIMEOUT: Duration = Duration::from_secs(120);
const WELCOME_TAB_SETTLE: Duration = Duration::from_secs(3);
const WELCOME_TAB_POLL: Duration = Duration::from_millis(500);

/// The extension opens a welcome page in a second tab. Closing it the moment
/// it appears makes the browser open it again, so wait a short settle time
/// before switching to it, closing it, and switching back.
async fn dismiss_extension_welcome_tab(session: &WebDriverSession) -> Result<(), WdError> {
    let deadline = Instant::now() + WELCOME_TAB_TIMEOUT;
    let handles = loop {
        let handles = session.window_handles().await?;
        if handles.len() > 1 {
            break handles;
        }
        if Instant::now() >= deadline {
            return Err(WdError::Driver(
                "extension welcome tab never opened".to_string(),
            ));
        }
        tokio::time::sleep(WELCOME_TAB_POLL).await;
    };
    tokio::time::sleep(WELCOME_TAB_SETTLE).await;
    session.switch_window(&handles[1]).await?;
    session.close_window().await?;
    session.switch_window(&handles[0]).await?;
    debug!("closed extension welcome tab");
    Ok(())
}

fn webdriver_reachable(endpoint: &str) -> bool {
    let parsed = match Url::parse(endpoint) {
        Ok(u) => u,
        Err(_) => return false,
    };
    let host = match parsed.host_str() {
        Some(h) => h,
        None => return false,
    };
    let port = parsed.port_or_known_default().unwrap_or(4444);
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok())
}

fn default_driver_binary(browser: BrowserArg) -> &'static str {
    match browser {
        BrowserArg::Chrome => "chromedriver",
        BrowserArg::Firefox => "geckodriver",
        BrowserArg::Edge => "msedgedriver",
    }
}

fn configure_driver_command(cmd: &mut Command, bin: &str, port: u16) {
    let lower = bin.to_ascii_lowercase();
    if lower.contains("geckodriver") {
        cmd.arg("--port").arg(port.to_string());
        return;
    }
    cmd.arg(format!("--port={port}"));
    cmd.arg("--allowed-origins=*");
    if lower.contains("chromedriver") {
        cmd.arg("--log-level=SEVERE");
    }
}

fn driver_log_path(port: u16) -> Result<PathBuf, WdError> {
    let dir = std::env::temp_dir().join("sitesweep");
    fs::create_dir_all(&dir)
        .map_err(|e| WdError::Driver(format!("driver log dir create failed: {e}")))?;
    Ok(dir.join(format!("webdriver-{port}.log")))
}

fn read_log_tail(path: &Path, lines: usize) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let tail = text
        .lines()
        .rev()
        .take(lines.max(1))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" | ");
    if tail.is_empty() { None } else { Some(tail) }
}

fn find_free_local_port() -> Result<u16, WdError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| WdError::Driver(format!("free port bind failed: {e}")))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| WdError::Driver(format!("local addr failed: {e}")))
}

/// Spawn a local driver binary and wait until its endpoint accepts
/// connections; on failure the child is killed and the log tail is surfaced.
async fn start_webdriver(cli: &Cli, endpoint: &str) -> Result<Child, WdError> {
    let parsed = Url::parse(endpoint)
        .map_err(|e| WdError::Driver(format!("invalid webdriver url: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| WdError::Driver("webdriver url has no host".to_string()))?
        .to_ascii_lowercase();
    if host != "localhost" && host != "127.0.0.1" {
        return Err(WdError::Driver(
            "autostart only supports localhost endpoints".to_string(),
        ));
    }
    let port = parsed.port_or_known_default().unwrap_or(4444);

    let binary = cli
        .webdriver_binary
        .clone()
        .or_else(|| std::env::var("SITESWEEP_WEBDRIVER_BINARY").ok())
        .unwrap_or_else(|| default_driver_binary(cli.browser).to_string());

    let log_path = driver_log_path(port)?;
    let log_file = File::options()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .map_err(|e| {
            WdError::Driver(format!(
                "failed to open webdriver log {}: {e}",
                log_path.display()
            ))
        })?;
    let log_file_err = log_file
        .try_clone()
        .map_err(|e| WdError::Driver(format!("failed to clone webdriver log handle: {e}")))?;

    let mut cmd = Command::new(&binary);
    configure_driver_command(&mut cmd, &binary, port);
    cmd.stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .stdin(Stdio::null());

    let mut child = cmd
        .spawn()
        .map_err(|e| WdError::Driver(format!("failed to spawn {binary}: {e}")))?;

    let steps = (cli.webdriver_start_timeout_ms / 200).max(1);
    let mut last_err = String::new();
    for _ in 0..steps {
        if webdriver_reachable(endpoint) {
            return Ok(child);
        }
        if let Ok(Some(status)) = child.try_wait() {
            last_err = format!(
                "{binary} exited early with status {status} (log: {})",
                log_path.display()
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    let _ = child.kill();
    let _ = child.wait();
    if last_err.is_empty() {
        last_err = format!(
            "{binary} did not become ready in time (log: {})",
            log_path.display()
        );
    }
    if let Some(tail) = read_log_tail(&log_path, 30) {
        last_err = format!("{last_err}; tail: {tail}");
    }
    Err(WdError::Driver(last_err))
}

/// Resolve a usable WebDriver endpoint: autostart a local driver on a free
/// port unless disabled, otherwise attach to an already-running endpoint.
async fn ensure_webdriver(cli: &Cli) -> Result<(String, Option<Child>), WdError> {
    if !cli.no_webdriver_autostart {
        let port = find_free_local_port()?;
        let endpoint = format!("http://127.0.0.1:{port}");
        match start_webdriver(cli, &endpoint).await {
            Ok(child) => {
                info!("webdriver autostarted at {endpoint}");
                return Ok((endpoint, Some(child)));
            }
            Err(err) => {
                warn!("webdriver autostart failed: {err}");
            }
        }
    }

    if webdriver_reachable(&cli.webdriver_url) {
        info!("webdriver endpoint reachable at {}", cli.webdriver_url);
        return Ok((cli.webdriver_url.clone(), None));
    }

    Err(WdError::Driver(format!(
        "webdriver endpoint {} unreachable",
        cli.webdriver_url
    )))
}

fn stop_webdriver(mut child: Option<Child>) {
    if let Some(ref mut c) = child {
        let _ = c.kill();
        let _ = c.wait();
    }
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}
