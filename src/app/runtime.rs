fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn collect_targets(cli: &Cli) -> io::Result<Vec<FetchTarget>> {
    if let Some(url) = &cli.url {
        return Ok(vec![FetchTarget {
            url: url.clone(),
            gambling_site: cli.gambling,
        }]);
    }
    let Some(path) = &cli.targets else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no target file or --url given",
        ));
    };
    load_targets_from_file(path, cli.gambling)
}

/// Drain fetch results into the sink as they arrive, so a crash partway
/// through a long batch still leaves the completed rows on disk.
fn write_results(
    mut rx: UnboundedReceiver<FetchEvent>,
    sink: &mut OutputSink,
) -> io::Result<RunStats> {
    let mut stats = RunStats::default();
    loop {
        match rx.try_recv() {
            Ok(FetchEvent::Result(result)) => {
                stats.record(&result);
                sink.write_result(&result)?;
                sink.flush()?;
            }
            Ok(FetchEvent::Finished) => break,
            Err(mpsc::error::TryRecvError::Empty) => {
                std::thread::sleep(Duration::from_millis(120));
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }
    }
    sink.finalize()?;
    Ok(stats)
}

pub async fn run() -> io::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let targets = collect_targets(&cli)?;
    if targets.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "target list is empty",
        ));
    }

    let (format, output_path) = match &cli.output {
        Some(path) => (detect_data_format(path, cli.format.into()), path.clone()),
        None => {
            let format = DataFormat::from(cli.format);
            let label = cli.targets.as_deref().unwrap_or("sweep");
            (format, default_output_path(label, format))
        }
    };
    let mut sink = OutputSink::new(&output_path, format)?;

    let delays = FetchDelays::from(&cli);
    let (endpoint, driver_process) = ensure_webdriver(&cli).await.map_err(io::Error::other)?;
    let session = match open_session(&cli, &endpoint).await {
        Ok(session) => session,
        Err(err) => {
            stop_webdriver(driver_process);
            return Err(io::Error::other(err.to_string()));
        }
    };

    info!(
        "fetching {} page(s) via {} -> {}",
        targets.len(),
        endpoint,
        output_path
    );

    let (tx, rx) = mpsc::unbounded_channel::<FetchEvent>();
    let fetch_task = tokio::spawn(async move {
        run_batch(&session, targets, delays, tx).await;
        if let Err(err) = session.quit().await {
            warn!("failed to close browser session: {err}");
        }
    });

    // writer errors must not skip session/driver teardown
    let write_outcome = write_results(rx, &mut sink);

    if let Err(err) = fetch_task.await {
        error!("fetch task panicked: {err}");
    }
    stop_webdriver(driver_process);
    let stats = write_outcome?;

    info!(
        "done: {} fetched, {} failed, {} total -> {}",
        stats.fetched,
        stats.failed,
        stats.total(),
        output_path
    );
    Ok(())
}
