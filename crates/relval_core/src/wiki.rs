//! The wiki boundary: the capability trait the rest of the crate consumes,
//! the blocking MediaWiki client implementing it, the event/page resolvers
//! that map loose criteria onto canonical pages, and the batch reporter.

use std::collections::BTreeMap;
use std::thread::sleep;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::compose::{ComposeClass, classify_compose, parse_compose_id};
use crate::config::{TcmsConfig, env_value_u64, env_value_usize};
use crate::error::{TcmsError, TcmsResult};
use crate::event::{ValidationEvent, current_pointer_name};
use crate::helpers::validate_dist;
use crate::page::{Page, RowCriteria, Section};
use crate::result::{ResultRow, Status, TestResult};

/// Pungi 4 retired the "Final" milestone name in favor of "RC" starting
/// with the release after this one.
const LAST_FINAL_RELEASE: u32 = 23;

/// What a save actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The new text equals the old text; nothing was written.
    NoChange,
}

/// The capability set this crate consumes from a wiki. Missing pages are
/// not errors: `fetch_text` reports them as empty text and
/// `fetch_sections` as an empty list (as it does any remote failure).
pub trait WikiApi {
    fn fetch_text(&mut self, page: &str) -> TcmsResult<String>;
    fn fetch_sections(&mut self, page: &str) -> Vec<Section>;
    /// Save a page. A supplied `precondition_old_text` makes the save
    /// fail with `EditConflict` if the page changed since that text was
    /// fetched; `create_only` makes it fail with `PageExists` if the page
    /// is already there.
    fn save_text(
        &mut self,
        page: &str,
        text: &str,
        summary: &str,
        precondition_old_text: Option<&str>,
        create_only: bool,
    ) -> TcmsResult<SaveOutcome>;
}

/// Blocking MediaWiki API client. One instance holds the session cookies,
/// the cached CSRF token, and the base revision timestamps used to turn
/// save preconditions into edit-conflict detection on the wire.
pub struct MediaWikiClient {
    client: Client,
    api_url: String,
    user_agent: String,
    rate_limit_read_ms: u64,
    rate_limit_write_ms: u64,
    max_retries: usize,
    retry_delay_ms: u64,
    last_request_at: Option<Instant>,
    csrf_token: Option<String>,
    base_timestamps: BTreeMap<String, String>,
}

impl MediaWikiClient {
    pub fn new(config: &TcmsConfig) -> TcmsResult<Self> {
        let timeout_ms = env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000);
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .cookie_store(true)
            .build()
            .map_err(|err| TcmsError::Transport(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            api_url: config.api_url(),
            user_agent: config.user_agent(),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("WIKI_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_value_usize("WIKI_HTTP_RETRIES", 2),
            retry_delay_ms: env_value_u64("WIKI_HTTP_RETRY_DELAY_MS", 500),
            last_request_at: None,
            csrf_token: None,
            base_timestamps: BTreeMap::new(),
        })
    }

    /// Log in with a bot username/password pair. Required before any save
    /// on wikis that do not allow anonymous edits.
    pub fn login(&mut self, username: &str, password: &str) -> TcmsResult<()> {
        let token_payload = self.request_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let tokens: TokenQueryResponse = decode(token_payload, "login token response")?;
        let login_token = tokens
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| TcmsError::Transport("failed to get login token".to_string()))?;

        let payload = self.request_post(&[
            ("action", "login".to_string()),
            ("lgname", username.to_string()),
            ("lgpassword", password.to_string()),
            ("lgtoken", login_token),
        ])?;
        if let Some((code, info)) = payload_error(&payload) {
            return Err(TcmsError::Transport(format!(
                "login failed [{code}]: {info}"
            )));
        }
        let login: LoginResponse = decode(payload, "login response")?;
        match login.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                Ok(())
            }
            other => Err(TcmsError::Transport(format!(
                "login failed: {}",
                login
                    .login
                    .reason
                    .or_else(|| other.map(str::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ))),
        }
    }

    fn ensure_csrf_token(&mut self) -> TcmsResult<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let payload = self.request_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let tokens: TokenQueryResponse = decode(payload, "csrf token response")?;
        let token = tokens
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| TcmsError::Transport("failed to get csrf token".to_string()))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    /// GET request with standard parameters. An error payload from the
    /// API surfaces as a transport error; reads have no failure modes the
    /// caller needs to tell apart.
    fn request_get(&mut self, params: &[(&str, String)]) -> TcmsResult<Value> {
        let payload = self.request_raw(params, false)?;
        if let Some((code, info)) = payload_error(&payload) {
            return Err(TcmsError::Transport(format!(
                "MediaWiki API error [{code}]: {info}"
            )));
        }
        Ok(payload)
    }

    /// POST request with standard parameters. The error payload, if any,
    /// is left in place: writes need to distinguish edit conflicts from
    /// other failures, so the caller inspects it.
    fn request_post(&mut self, params: &[(&str, String)]) -> TcmsResult<Value> {
        self.request_raw(params, true)
    }

    fn request_raw(&mut self, params: &[(&str, String)], is_write: bool) -> TcmsResult<Value> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        for attempt in 0..=self.max_retries {
            self.apply_rate_limit(is_write);
            let request = if is_write {
                self.client.post(&self.api_url).form(&pairs)
            } else {
                self.client.get(&self.api_url).query(&pairs)
            };
            let response = request
                .header("User-Agent", self.user_agent.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        return Err(TcmsError::Transport(format!(
                            "MediaWiki API request failed with HTTP {status}"
                        )));
                    }
                    return response.json().map_err(|err| {
                        TcmsError::Transport(format!("failed to decode API response: {err}"))
                    });
                }
                Err(error) => {
                    if attempt < self.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(TcmsError::Transport(format!(
                        "failed to call MediaWiki API: {error}"
                    )));
                }
            }
        }
        Err(TcmsError::Transport(
            "MediaWiki API request exhausted retry budget".to_string(),
        ))
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        sleep(Duration::from_millis(
            self.retry_delay_ms
                .saturating_mul(2u64.saturating_pow(exponent)),
        ));
    }
}

impl WikiApi for MediaWikiClient {
    fn fetch_text(&mut self, page: &str) -> TcmsResult<String> {
        let payload = self.request_get(&[
            ("action", "query".to_string()),
            ("titles", page.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content|timestamp".to_string()),
            ("rvslots", "main".to_string()),
            ("rvlimit", "1".to_string()),
        ])?;
        let query: QueryResponse = decode(payload, "page content response")?;
        let Some(pageitem) = query.query.pages.first() else {
            return Ok(String::new());
        };
        if pageitem.missing.unwrap_or(false) {
            return Ok(String::new());
        }
        let Some(revision) = pageitem.revisions.first() else {
            return Ok(String::new());
        };
        if let Some(timestamp) = &revision.timestamp {
            self.base_timestamps
                .insert(page.to_string(), timestamp.clone());
        }
        Ok(revision
            .slots
            .as_ref()
            .and_then(|slots| slots.main.as_ref())
            .map(|slot| slot.content.clone())
            .unwrap_or_default())
    }

    fn fetch_sections(&mut self, page: &str) -> Vec<Section> {
        let Ok(payload) = self.request_get(&[
            ("action", "parse".to_string()),
            ("page", page.to_string()),
            ("prop", "sections".to_string()),
        ]) else {
            return Vec::new();
        };
        let Ok(parsed) = decode::<ParseResponse>(payload, "section list response") else {
            return Vec::new();
        };
        let Some(parse) = parsed.parse else {
            return Vec::new();
        };
        parse
            .sections
            .into_iter()
            .filter_map(|section| {
                // transcluded sections have no index/offset on this page
                // and cannot be edited through it
                let index = section.index?.parse::<i64>().ok()?;
                let byte_offset = usize::try_from(section.byteoffset?).ok()?;
                Some(Section {
                    heading: section.line?,
                    index,
                    byte_offset,
                })
            })
            .collect()
    }

    fn save_text(
        &mut self,
        page: &str,
        text: &str,
        summary: &str,
        precondition_old_text: Option<&str>,
        create_only: bool,
    ) -> TcmsResult<SaveOutcome> {
        let token = self.ensure_csrf_token()?;
        let mut params = vec![
            ("action", "edit".to_string()),
            ("title", page.to_string()),
            ("text", text.to_string()),
            ("summary", summary.to_string()),
            ("bot", "1".to_string()),
            ("token", token),
        ];
        if create_only {
            params.push(("createonly", "1".to_string()));
        }
        if precondition_old_text.is_some()
            && let Some(base) = self.base_timestamps.get(page)
        {
            params.push(("basetimestamp", base.clone()));
        }

        let payload = self.request_post(&params)?;
        if let Some((code, info)) = payload_error(&payload) {
            return Err(match code.as_str() {
                "editconflict" => TcmsError::EditConflict {
                    page: page.to_string(),
                },
                "articleexists" => TcmsError::PageExists {
                    page: page.to_string(),
                },
                _ => TcmsError::Transport(format!("MediaWiki API error [{code}]: {info}")),
            });
        }
        let edit: EditResponse = decode(payload, "edit response")?;
        let Some(edit) = edit.edit else {
            return Err(TcmsError::Transport(format!(
                "missing edit payload saving {page}"
            )));
        };
        if edit.result.as_deref() != Some("Success") {
            return Err(TcmsError::Transport(format!(
                "edit of {page} failed: {}",
                edit.result.unwrap_or_else(|| "unknown".to_string())
            )));
        }
        if edit.nochange.unwrap_or(false) {
            return Ok(SaveOutcome::NoChange);
        }
        if let Some(timestamp) = edit.newtimestamp {
            self.base_timestamps.insert(page.to_string(), timestamp);
        }
        Ok(SaveOutcome::Saved)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn payload_error(payload: &Value) -> Option<(String, String)> {
    let error = payload.get("error")?;
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    let info = error
        .get("info")
        .and_then(Value::as_str)
        .unwrap_or("unknown info");
    Some((code.to_string(), info.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(payload: Value, what: &str) -> TcmsResult<T> {
    serde_json::from_value(payload)
        .map_err(|err| TcmsError::Transport(format!("failed to decode {what}: {err}")))
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    missing: Option<bool>,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    timestamp: Option<String>,
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct ParseResponse {
    parse: Option<ParsePayload>,
}

#[derive(Debug, Deserialize, Default)]
struct ParsePayload {
    #[serde(default)]
    sections: Vec<SectionItem>,
}

#[derive(Debug, Deserialize)]
struct SectionItem {
    line: Option<String>,
    index: Option<String>,
    byteoffset: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditResponse {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct EditPayload {
    result: Option<String>,
    nochange: Option<bool>,
    newtimestamp: Option<String>,
}

/// Read the key/value fields stored in the current-event pointer page for
/// a dist. An empty map means no pointer page exists.
pub fn get_current_compose<A: WikiApi>(
    api: &mut A,
    config: &TcmsConfig,
    dist: &str,
) -> TcmsResult<BTreeMap<String, String>> {
    validate_dist(dist, config)?;
    let text = api.fetch_text(&current_pointer_name(dist))?;
    let mut fields = BTreeMap::new();
    for line in text.lines() {
        if let Some((key, value)) = parse_pointer_line(line) {
            fields.insert(key, value);
        }
    }
    Ok(fields)
}

/// One `| key = value` line of the pointer template's switch body.
fn parse_pointer_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix('|')?;
    let (key, value) = rest.split_once('=')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() || !key.chars().all(|ch| ch.is_alphanumeric() || ch == '_') {
        return None;
    }
    if !value
        .chars()
        .all(|ch| ch.is_alphanumeric() || matches!(ch, '_' | ' ' | '.'))
    {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

/// The current validation event for a dist, built from the pointer page.
pub fn get_current_event<A: WikiApi>(
    api: &mut A,
    config: &TcmsConfig,
    dist: &str,
) -> TcmsResult<ValidationEvent> {
    let curr = get_current_compose(api, config, dist)?;
    if curr.is_empty() {
        return Err(TcmsError::NotFound(format!(
            "no current validation event exists for dist {dist}"
        )));
    }
    let field = |key: &str| {
        curr.get(key).cloned().ok_or_else(|| {
            TcmsError::NotFound(format!(
                "current event pointer for {dist} is missing the {key} field"
            ))
        })
    };
    let release = field("release")?;
    let milestone = field("milestone")?;
    // exactly one of these is ever set; max() picks it without caring which
    let compose = field("compose")?.max(field("date")?);
    match classify_compose(&compose)? {
        ComposeClass::Nightly => Ok(ValidationEvent::nightly(dist, &release, &milestone, &compose)),
        ComposeClass::Milestone => Ok(ValidationEvent::compose(dist, &release, &milestone, &compose)),
    }
}

/// Loose identifying criteria for event/page resolution. Anything left
/// empty is filled in from the compose id or the current event.
#[derive(Debug, Clone, Default)]
pub struct EventCriteria {
    pub release: String,
    pub milestone: String,
    pub compose: String,
    /// Fully-qualified compose id; overrides everything else, dist
    /// included.
    pub cid: String,
    /// Compose stream; the configured default when empty.
    pub dist: String,
}

#[derive(Debug)]
struct ResolvedIdentity {
    dist: String,
    release: String,
    /// Empty only for a nightly compose that still needs probing.
    milestone: String,
    compose: String,
    class: ComposeClass,
}

/// The shared front half of event/page resolution: apply the compose-id
/// override, fill in missing values from the current event (failing on
/// any conflict with what the caller supplied), classify the compose and
/// apply the milestone naming rules.
fn resolve_identity<A: WikiApi>(
    api: &mut A,
    config: &TcmsConfig,
    criteria: &EventCriteria,
) -> TcmsResult<ResolvedIdentity> {
    let mut dist = if criteria.dist.is_empty() {
        config.default_dist().to_string()
    } else {
        criteria.dist.clone()
    };
    let mut release = criteria.release.clone();
    let mut milestone = criteria.milestone.clone();
    let mut compose = criteria.compose.clone();

    if !criteria.cid.is_empty() {
        (dist, release, milestone, compose) = parse_compose_id(&criteria.cid)?;
    }
    validate_dist(&dist, config)?;

    if compose.is_empty() || release.is_empty() {
        // not enough to identify an event; default the missing values
        // from the current event, and never silently override a value
        // the caller did supply
        let event = get_current_event(api, config, &dist)?;
        for (name, supplied, current) in [
            ("release", &release, &event.release),
            ("milestone", &milestone, &event.milestone),
            ("compose", &compose, &event.compose),
        ] {
            if !supplied.is_empty() && supplied != current {
                return Err(TcmsError::TooManyMatches(format!(
                    "current event {name} {current} does not match requested {name} {supplied}"
                )));
            }
        }
        release = event.release;
        milestone = event.milestone;
        compose = event.compose;
    }

    let class = classify_compose(&compose)?;
    if class == ComposeClass::Milestone {
        if milestone.is_empty() {
            return Err(TcmsError::MissingMilestone);
        }
        compose = compose.to_ascii_uppercase();
        if let Ok(relnum) = release.parse::<u32>()
            && relnum > LAST_FINAL_RELEASE
            && milestone.eq_ignore_ascii_case("final")
        {
            milestone = "RC".to_string();
        }
    }
    Ok(ResolvedIdentity {
        dist,
        release,
        milestone,
        compose,
        class,
    })
}

/// Resolve loose criteria to a validation event. Fully-specified criteria
/// resolve without touching the wiki; a date compose with no milestone is
/// probed as a Rawhide then a Branched event, taking the first whose
/// first result page has content. An event nobody has created is never
/// fabricated that way.
pub fn get_validation_event<A: WikiApi>(
    api: &mut A,
    config: &TcmsConfig,
    criteria: &EventCriteria,
) -> TcmsResult<ValidationEvent> {
    let id = resolve_identity(api, config, criteria)?;
    match id.class {
        ComposeClass::Milestone => Ok(ValidationEvent::compose(
            &id.dist,
            &id.release,
            &id.milestone,
            &id.compose,
        )),
        ComposeClass::Nightly if !id.milestone.is_empty() => Ok(ValidationEvent::nightly(
            &id.dist,
            &id.release,
            &id.milestone,
            &id.compose,
        )),
        ComposeClass::Nightly => {
            for milestone in ["Rawhide", "Branched"] {
                let event = ValidationEvent::nightly(&id.dist, &id.release, milestone, &id.compose);
                let pages = event.result_pages(config);
                let Some(page) = pages.first() else {
                    break;
                };
                if !api.fetch_text(&page.name())?.is_empty() {
                    return Ok(event);
                }
            }
            Err(TcmsError::NotFound(format!(
                "no validation event exists for release {} and date {}",
                id.release, id.compose
            )))
        }
    }
}

/// Resolve loose criteria to one per-testtype validation page. Same
/// decision procedure as `get_validation_event`; the nightly probe checks
/// the page for the requested test type.
pub fn get_validation_page<A: WikiApi>(
    api: &mut A,
    config: &TcmsConfig,
    testtype: &str,
    criteria: &EventCriteria,
) -> TcmsResult<Page> {
    let id = resolve_identity(api, config, criteria)?;
    match id.class {
        ComposeClass::Milestone => Ok(Page::compose(
            &id.dist,
            &id.release,
            &id.milestone,
            &id.compose,
            testtype,
        )),
        ComposeClass::Nightly if !id.milestone.is_empty() => Ok(Page::nightly(
            &id.dist,
            &id.release,
            &id.milestone,
            &id.compose,
            testtype,
        )),
        ComposeClass::Nightly => {
            for milestone in ["Rawhide", "Branched"] {
                let page = Page::nightly(&id.dist, &id.release, milestone, &id.compose, testtype);
                if !api.fetch_text(&page.name())?.is_empty() {
                    return Ok(page);
                }
            }
            Err(TcmsError::NotFound(format!(
                "no validation page exists for release {} and date {}",
                id.release, id.compose
            )))
        }
    }
}

/// One loose result submission for `report_validation_results`: page
/// criteria, row criteria, and the result fields, all optional except the
/// test type, test case and status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportItem {
    pub testtype: String,
    pub release: String,
    pub milestone: String,
    pub compose: String,
    pub testcase: String,
    pub section: String,
    pub testname: String,
    pub env: String,
    pub status: String,
    pub user: String,
    pub bugs: Vec<String>,
    pub comment: String,
    pub bot: bool,
    pub cid: String,
    pub dist: String,
}

/// Failures meaning "this submission did not identify one page/row";
/// everything else is a real error the whole batch stops on.
fn is_resolution_failure(err: &TcmsError) -> bool {
    matches!(
        err,
        TcmsError::NotFound(_)
            | TcmsError::TooManyMatches(_)
            | TcmsError::InvalidCompose(_)
            | TcmsError::MissingMilestone
    )
}

struct PageGroup {
    page: Page,
    rows: Vec<(ResultRow, Vec<(String, TestResult)>)>,
}

type PageKey = (String, String, String, String, String, String);

/// Batch result reporting: sort loose submissions by the page they
/// resolve to, narrow each to a row, and file everything with one
/// mutation per touched page. Items whose criteria cannot identify one
/// page and row come back in the first list; duplicate submissions come
/// back (reconstructed with the resolved values) in the second.
pub fn report_validation_results<A: WikiApi>(
    api: &mut A,
    config: &TcmsConfig,
    items: &[ReportItem],
    default_user: &str,
    allow_dupe: bool,
) -> TcmsResult<(Vec<ReportItem>, Vec<ReportItem>)> {
    let mut groups: Vec<(PageKey, Option<PageGroup>)> = Vec::new();
    let mut insufficients = Vec::new();
    let mut dupes = Vec::new();

    for item in items {
        // reporting a placeholder or unknown status makes no sense here
        let Some(status) = Status::parse(&item.status) else {
            insufficients.push(item.clone());
            continue;
        };
        let key: PageKey = (
            item.testtype.clone(),
            item.release.clone(),
            item.milestone.clone(),
            item.compose.clone(),
            item.cid.clone(),
            item.dist.clone(),
        );
        let group_idx = match groups.iter().position(|(seen, _)| *seen == key) {
            Some(idx) => idx,
            None => {
                let criteria = EventCriteria {
                    release: item.release.clone(),
                    milestone: item.milestone.clone(),
                    compose: item.compose.clone(),
                    cid: item.cid.clone(),
                    dist: item.dist.clone(),
                };
                let group = match get_validation_page(api, config, &item.testtype, &criteria) {
                    Ok(page) => Some(PageGroup {
                        page,
                        rows: Vec::new(),
                    }),
                    Err(err) if is_resolution_failure(&err) => None,
                    Err(err) => return Err(err),
                };
                groups.push((key, group));
                groups.len() - 1
            }
        };
        let Some(group) = groups[group_idx].1.as_mut() else {
            insufficients.push(item.clone());
            continue;
        };

        let criteria = RowCriteria {
            testcase: item.testcase.clone(),
            section: item.section.clone(),
            testname: item.testname.clone(),
            env: item.env.clone(),
        };
        let row = match group.page.find_resultrow(api, config, &criteria) {
            Ok(row) => row,
            Err(err) if is_resolution_failure(&err) => {
                insufficients.push(item.clone());
                continue;
            }
            Err(err) => return Err(err),
        };
        let user = if item.user.is_empty() {
            default_user.to_lowercase()
        } else {
            item.user.clone()
        };
        let result = TestResult {
            status: Some(status),
            user,
            bugs: item.bugs.clone(),
            comment: item.comment.clone(),
            bot: item.bot,
        };
        // one entry per distinct row, or the page edit goes wrong
        match group.rows.iter_mut().find(|(seen, _)| seen.matches(&row)) {
            Some((_, envresults)) => envresults.push((item.env.clone(), result)),
            None => group.rows.push((row, vec![(item.env.clone(), result)])),
        }
    }

    for (_, group) in groups {
        let Some(PageGroup { mut page, rows }) = group else {
            continue;
        };
        if rows.is_empty() {
            continue;
        }
        let rejected = page.add_results(api, config, rows, allow_dupe)?;
        for (row, env, result) in rejected {
            dupes.push(ReportItem {
                testtype: page.testtype.clone(),
                release: page.release.clone(),
                milestone: page.milestone.clone(),
                compose: page.compose.clone(),
                testcase: row.testcase,
                section: row.section,
                testname: row.name,
                env,
                status: result.status.map(Status::as_str).unwrap_or("none").to_string(),
                user: result.user,
                bugs: result.bugs,
                comment: result.comment,
                bot: result.bot,
                cid: String::new(),
                dist: page.dist.clone(),
            });
        }
    }
    Ok((insufficients, dupes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockWiki, page_with_text};

    fn config() -> TcmsConfig {
        let mut config = TcmsConfig::default();
        config.wiki.edit_retry_delay_ms = Some(0);
        config
    }

    const FAKE_CURRENT: &str = "{{tempdoc}}\n<onlyinclude>{{#switch: {{{1|full}}}\n\
| full = 24 Alpha 1.1\n| release = 24\n| milestone = Alpha\n| compose = 1.1\n| date =\n\
}}</onlyinclude>\n[[Category: Fedora Templates]]";

    #[test]
    fn current_compose_reads_the_pointer_fields() {
        let mut api = MockWiki::default();
        page_with_text(&mut api, "Template:CurrentFedoraCompose", FAKE_CURRENT);
        let curr = get_current_compose(&mut api, &config(), "Fedora").expect("pointer");
        assert_eq!(curr.len(), 5);
        assert_eq!(curr["full"], "24 Alpha 1.1");
        assert_eq!(curr["release"], "24");
        assert_eq!(curr["milestone"], "Alpha");
        assert_eq!(curr["compose"], "1.1");
        assert_eq!(curr["date"], "");
    }

    #[test]
    fn current_event_takes_whichever_compose_field_is_set() {
        let mut api = MockWiki::default();
        let config = config();
        page_with_text(&mut api, "Template:CurrentFedoraCompose", FAKE_CURRENT);
        let event = get_current_event(&mut api, &config, "Fedora").expect("event");
        assert_eq!(event, ValidationEvent::compose("Fedora", "24", "Alpha", "1.1"));

        let nightly = ValidationEvent::nightly("Fedora", "25", "Rawhide", "20160922.n.0");
        nightly.update_current(&mut api, &config).expect("pointer");
        let event = get_current_event(&mut api, &config, "Fedora").expect("event");
        assert_eq!(event, nightly);
    }

    #[test]
    fn missing_pointer_is_not_found() {
        let mut api = MockWiki::default();
        let err = get_current_event(&mut api, &config(), "Fedora").expect_err("no pointer");
        assert!(matches!(err, TcmsError::NotFound(_)));
    }

    #[test]
    fn fully_specified_criteria_resolve_without_the_wiki() {
        let mut api = MockWiki::default();
        let config = config();
        let criteria = EventCriteria {
            release: "38".to_string(),
            milestone: "Beta".to_string(),
            compose: "RC3".to_string(),
            ..EventCriteria::default()
        };
        let first = get_validation_page(&mut api, &config, "Installation", &criteria)
            .expect("page")
            .name();
        let second = get_validation_page(&mut api, &config, "Installation", &criteria)
            .expect("page")
            .name();
        assert_eq!(first, "Test Results:Fedora 38 Beta RC3 Installation");
        assert_eq!(first, second);
        assert_eq!(api.reads, 0, "fully specified resolution must stay offline");

        let event = get_validation_event(&mut api, &config, &criteria).expect("event");
        assert_eq!(event, ValidationEvent::compose("Fedora", "38", "Beta", "RC3"));
        assert_eq!(api.reads, 0);
    }

    #[test]
    fn final_milestone_renames_to_rc_after_the_scheme_change() {
        let mut api = MockWiki::default();
        let config = config();
        let renamed = get_validation_page(
            &mut api,
            &config,
            "X",
            &EventCriteria {
                release: "24".to_string(),
                milestone: "Final".to_string(),
                compose: "RC1".to_string(),
                ..EventCriteria::default()
            },
        )
        .expect("page");
        let explicit = get_validation_page(
            &mut api,
            &config,
            "X",
            &EventCriteria {
                release: "24".to_string(),
                milestone: "RC".to_string(),
                compose: "RC1".to_string(),
                ..EventCriteria::default()
            },
        )
        .expect("page");
        assert_eq!(renamed.name(), explicit.name());

        // the rename only applies past the old scheme's last release
        let old = get_validation_page(
            &mut api,
            &config,
            "X",
            &EventCriteria {
                release: "23".to_string(),
                milestone: "Final".to_string(),
                compose: "TC1".to_string(),
                ..EventCriteria::default()
            },
        )
        .expect("page");
        assert_eq!(old.name(), "Test Results:Fedora 23 Final TC1 X");
    }

    #[test]
    fn candidate_composes_require_a_milestone() {
        let mut api = MockWiki::default();
        let err = get_validation_event(
            &mut api,
            &config(),
            &EventCriteria {
                release: "32".to_string(),
                compose: "RC3".to_string(),
                ..EventCriteria::default()
            },
        )
        .expect_err("no milestone");
        assert!(matches!(err, TcmsError::MissingMilestone));
    }

    #[test]
    fn invalid_compose_values_are_rejected() {
        let mut api = MockWiki::default();
        let err = get_validation_event(
            &mut api,
            &config(),
            &EventCriteria {
                release: "32".to_string(),
                milestone: "Beta".to_string(),
                compose: "banana".to_string(),
                ..EventCriteria::default()
            },
        )
        .expect_err("invalid");
        assert!(matches!(err, TcmsError::InvalidCompose(_)));
    }

    #[test]
    fn underspecified_criteria_default_from_the_current_event() {
        let mut api = MockWiki::default();
        let config = config();
        page_with_text(&mut api, "Template:CurrentFedoraCompose", FAKE_CURRENT);

        let event =
            get_validation_event(&mut api, &config, &EventCriteria::default()).expect("current");
        assert_eq!(event, ValidationEvent::compose("Fedora", "24", "Alpha", "1.1"));

        // a supplied value that matches the current event is fine
        let page = get_validation_page(
            &mut api,
            &config,
            "Installation",
            &EventCriteria {
                release: "24".to_string(),
                ..EventCriteria::default()
            },
        )
        .expect("page");
        assert_eq!(page.name(), "Test Results:Fedora 24 Alpha 1.1 Installation");

        // a conflicting one is never silently overridden
        let err = get_validation_event(
            &mut api,
            &config,
            &EventCriteria {
                release: "23".to_string(),
                ..EventCriteria::default()
            },
        )
        .expect_err("release conflict");
        assert!(matches!(err, TcmsError::TooManyMatches(_)));
        let err = get_validation_event(
            &mut api,
            &config,
            &EventCriteria {
                milestone: "Beta".to_string(),
                ..EventCriteria::default()
            },
        )
        .expect_err("milestone conflict");
        assert!(matches!(err, TcmsError::TooManyMatches(_)));
    }

    #[test]
    fn nightly_dates_probe_rawhide_then_branched() {
        let mut api = MockWiki::default();
        let config = config();
        let criteria = EventCriteria {
            release: "25".to_string(),
            compose: "20160922.n.0".to_string(),
            ..EventCriteria::default()
        };

        // neither event exists yet: never fabricate one
        let err = get_validation_event(&mut api, &config, &criteria).expect_err("nothing");
        assert!(matches!(err, TcmsError::NotFound(_)));

        page_with_text(
            &mut api,
            "Test Results:Fedora 25 Branched 20160922.n.0 Installation",
            "branched results",
        );
        let event = get_validation_event(&mut api, &config, &criteria).expect("branched");
        assert_eq!(event.milestone, "Branched");

        // Rawhide wins when both exist
        page_with_text(
            &mut api,
            "Test Results:Fedora 25 Rawhide 20160922.n.0 Installation",
            "rawhide results",
        );
        let event = get_validation_event(&mut api, &config, &criteria).expect("rawhide");
        assert_eq!(event.milestone, "Rawhide");

        let page =
            get_validation_page(&mut api, &config, "Installation", &criteria).expect("page");
        assert_eq!(
            page.name(),
            "Test Results:Fedora 25 Rawhide 20160922.n.0 Installation"
        );

        // a supplied milestone skips the probing entirely
        let explicit = get_validation_page(
            &mut api,
            &config,
            "Base",
            &EventCriteria {
                milestone: "Branched".to_string(),
                ..criteria
            },
        )
        .expect("explicit");
        assert_eq!(
            explicit.name(),
            "Test Results:Fedora 25 Branched 20160922.n.0 Base"
        );
    }

    #[test]
    fn compose_ids_override_everything_else() {
        let mut api = MockWiki::default();
        let config = config();
        let page = get_validation_page(
            &mut api,
            &config,
            "Server",
            &EventCriteria {
                cid: "Fedora-27-20171108.n.1".to_string(),
                dist: "Fedora-IoT".to_string(),
                release: "99".to_string(),
                ..EventCriteria::default()
            },
        )
        .expect("page");
        assert_eq!(
            page.name(),
            "Test Results:Fedora 27 Branched 20171108.n.1 Server"
        );
        assert_eq!(api.reads, 0);
    }

    #[test]
    fn rawhide_compose_ids_fill_the_release_from_the_current_event() {
        let mut api = MockWiki::default();
        let config = config();
        let nightly = ValidationEvent::nightly("Fedora", "28", "Rawhide", "20180605.n.0");
        nightly.update_current(&mut api, &config).expect("pointer");

        let criteria = EventCriteria {
            cid: "Fedora-Rawhide-20180605.n.0".to_string(),
            ..EventCriteria::default()
        };
        let event = get_validation_event(&mut api, &config, &criteria).expect("event");
        assert_eq!(event, nightly);

        // a Rawhide cid for some other date conflicts with the pointer
        let err = get_validation_event(
            &mut api,
            &config,
            &EventCriteria {
                cid: "Fedora-Rawhide-20180606.n.0".to_string(),
                ..EventCriteria::default()
            },
        )
        .expect_err("stale cid");
        assert!(matches!(err, TcmsError::TooManyMatches(_)));
    }

    const REPORT_PAGE: &str = r#"== Test Matrix ==
{| class="wikitable"
|-
! Test case !! x86_64 !! aarch64
|-
| [[QA:Testcase_base_startup|Startup]]
| {{result|none}}
| {{result|pass|adamwill}}
|-
| [[QA:Testcase_base_services_start|Services]]
| {{result|none}}
| {{result|none}}
|-
|}
"#;

    fn report_item(testcase: &str, env: &str, status: &str, user: &str) -> ReportItem {
        ReportItem {
            testtype: "Base".to_string(),
            release: "32".to_string(),
            milestone: "Beta".to_string(),
            compose: "RC3".to_string(),
            testcase: testcase.to_string(),
            env: env.to_string(),
            status: status.to_string(),
            user: user.to_string(),
            ..ReportItem::default()
        }
    }

    #[test]
    fn report_partitions_insufficient_and_duplicate_items() {
        let mut api = MockWiki::default();
        let config = config();
        page_with_text(
            &mut api,
            "Test Results:Fedora 32 Beta RC3 Base",
            REPORT_PAGE,
        );

        let items = vec![
            report_item("QA:Testcase_base_startup", "x86_64", "pass", "kparal"),
            report_item("QA:Testcase_base_services_start", "x86_64", "fail", ""),
            // adamwill already reported startup on aarch64
            report_item("QA:Testcase_base_startup", "aarch64", "pass", "adamwill"),
            // no such row on the page
            report_item("QA:Testcase_nonexistent", "x86_64", "pass", "kparal"),
            // a placeholder status cannot be filed from here
            report_item("QA:Testcase_base_startup", "x86_64", "", "kparal"),
        ];
        let (insufficients, dupes) =
            report_validation_results(&mut api, &config, &items, "RelvalBot", false)
                .expect("report");

        assert_eq!(insufficients.len(), 2);
        assert!(insufficients.iter().any(|item| item.testcase == "QA:Testcase_nonexistent"));
        assert!(insufficients.iter().any(|item| item.status.is_empty()));

        assert_eq!(dupes.len(), 1);
        assert_eq!(dupes[0].user, "adamwill");
        assert_eq!(dupes[0].env, "aarch64");
        assert_eq!(dupes[0].testname, "Startup");

        // one save covers every accepted submission for the page
        assert_eq!(api.saves.len(), 1);
        let text = &api.pages["Test Results:Fedora 32 Beta RC3 Base"];
        assert!(text.contains("{{result|pass|kparal}}"));
        assert!(text.contains("{{result|fail|relvalbot}}"));
    }

    #[test]
    fn report_with_unresolvable_page_criteria_is_insufficient() {
        let mut api = MockWiki::default();
        let items = vec![ReportItem {
            testtype: "Base".to_string(),
            release: "32".to_string(),
            compose: "RC3".to_string(),
            testcase: "QA:Testcase_base_startup".to_string(),
            status: "pass".to_string(),
            ..ReportItem::default()
        }];
        let (insufficients, dupes) =
            report_validation_results(&mut api, &config(), &items, "bot", false).expect("report");
        assert_eq!(insufficients.len(), 1);
        assert!(dupes.is_empty());
        assert!(api.saves.is_empty());
    }
}
