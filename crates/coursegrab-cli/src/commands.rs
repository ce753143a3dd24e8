//! `coursegrab login`, `search` and `grab`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use coursegrab::progress;
use coursegrab::{
    redact, CatalogPage, CatalogQuery, CatalogRow, PortalHttpClient, RetryEngine, RetryOutcome,
    RunStatus, SessionState, TargetItem,
};

use crate::auth::CasAuthenticator;
use crate::config::AppConfig;
use crate::output;
use crate::secrets;

/// Log in, or build a session from a token given on the command line.
pub async fn establish_session(config: &AppConfig, token: Option<&str>) -> Result<SessionState> {
    let auth = CasAuthenticator::new(&config.portal.base_url, config.system.request_timeout_ms)?
        .with_sso_url(&config.portal.sso_url);

    if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
        tracing::info!(token = %redact(token), "using supplied token, skipping login");
        return auth
            .session_for(token.trim().to_string(), &config.course.batch_id)
            .await
            .context("failed to prepare session from supplied token");
    }

    let credentials = config.credentials()?;
    auth.login(&credentials, &config.course.batch_id)
        .await
        .context("CAS login failed")
}

/// Choose the class to register for from a search result.
///
/// An explicit class id wins even when the search did not list it; the
/// secret cascade will then look for it on its own.
pub fn pick_target(
    rows: &[CatalogRow],
    course_id: &str,
    keyword: &str,
    category: &str,
) -> Option<TargetItem> {
    let course_id = course_id.trim();
    if !course_id.is_empty() {
        let item = match rows.iter().find(|r| r.class_id == course_id) {
            Some(row) => TargetItem::new(&row.class_id, &row.course_name),
            None => {
                tracing::warn!(course_id, "class id not in search results, using it as given");
                TargetItem::new(course_id, keyword)
            }
        };
        return Some(item.with_category(category));
    }
    rows.first()
        .map(|row| TargetItem::new(&row.class_id, &row.course_name).with_category(category))
}

async fn search_catalog(
    http: &PortalHttpClient,
    config: &AppConfig,
    session: &SessionState,
    keyword: &str,
) -> Result<CatalogPage> {
    let query = CatalogQuery::new(keyword, &config.course.category);
    coursegrab::search(http, &config.endpoints(), session, &query)
        .await
        .with_context(|| format!("catalog search for {keyword:?} failed"))
}

/// `coursegrab login`: authenticate and show the session.
pub async fn login(config: &AppConfig, token: Option<&str>) -> Result<()> {
    let session = establish_session(config, token).await?;
    println!("  logged in");
    println!("  token:    {}", redact(&session.token));
    println!("  batch id: {}", session.batch_id);
    Ok(())
}

/// `coursegrab search`: list matching classes.
pub async fn search(config: &AppConfig, keyword: &str, token: Option<&str>) -> Result<()> {
    let session = establish_session(config, token).await?;
    let http = PortalHttpClient::new(config.system.request_timeout_ms);
    let page = search_catalog(&http, config, &session, keyword).await?;
    output::write_rows(&mut std::io::stdout().lock(), &page.rows)?;
    Ok(())
}

/// Load secrets saved by earlier runs into `session`, then record the
/// target's secret from this search. File problems only warn.
fn remember_secrets(
    config: &AppConfig,
    session: &mut SessionState,
    page: &CatalogPage,
    item: &TargetItem,
) {
    let Some(path) = config.system.secrets_file.as_deref() else {
        return;
    };
    match secrets::load_stored_secrets(path) {
        Ok(stored) => {
            tracing::debug!(count = stored.len(), path = %path.display(), "loaded stored secrets");
            session.stored_secrets = stored;
        }
        Err(e) => tracing::warn!(error = %e, "ignoring stored secrets"),
    }
    if let Some(secret) = page.find(&item.id).and_then(|row| row.secret.as_deref()) {
        if let Err(e) = secrets::append_secret(path, secret, Some(&item.id), "catalog") {
            tracing::warn!(error = %e, "could not save secret");
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GrabOptions {
    pub token: Option<String>,
    /// How many times to log in again after the session expires mid-run.
    pub relogin: u32,
}

/// `coursegrab grab`: search, pick the target and run the retry engine.
pub async fn grab(
    config: &AppConfig,
    options: &GrabOptions,
    cancel: CancellationToken,
) -> Result<RetryOutcome> {
    let mut session = establish_session(config, options.token.as_deref()).await?;
    let http = Arc::new(PortalHttpClient::new(config.system.request_timeout_ms));
    let keyword = config.user.target_course_name.trim().to_string();

    let page = search_catalog(&http, config, &session, &keyword).await?;
    let item = pick_target(
        &page.rows,
        &config.course.course_id,
        &keyword,
        &config.course.category,
    )
    .context("no class matched; pass --course-id or a different course name")?;
    remember_secrets(config, &mut session, &page, &item);
    session.capture_rows(page.rows);
    println!("  target: {item}");

    let (tx, rx) = progress::channel();
    let printer = tokio::spawn(output::print_progress(rx));

    let mut relogins_left = options.relogin;
    let outcome = loop {
        let engine = RetryEngine::new(http.clone(), config.engine_config(), cancel.clone())
            .with_sink(Arc::new(tx.clone()));
        let outcome = engine.run(&session, &item).await;

        if outcome.status != RunStatus::AuthExpired || relogins_left == 0 || cancel.is_cancelled()
        {
            break outcome;
        }
        relogins_left -= 1;
        tracing::warn!(remaining = relogins_left, "session expired, logging in again");
        match establish_session(config, None).await {
            Ok(fresh) => session = fresh,
            Err(e) => {
                tracing::warn!(error = %e, "re-login failed");
                break outcome;
            }
        }
    };

    drop(tx);
    let _ = printer.await;
    Ok(outcome)
}
