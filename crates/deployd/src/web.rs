//! Web interface for accessing deployments and (re)starting them.
//!
//! The controller serves HTML pages under a configurable mount prefix. All
//! pages except the login surface and the stylesheet require a session.
//! Handlers run concurrently on a small pool of worker threads sharing the
//! listener; deployment tasks run on their own threads owned by the
//! [`TaskSupervisor`].

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use indexmap::IndexMap;
use log::{error, info, warn};
use minijinja::{Environment, context};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tiny_http::{Header, Method, Response};

use crate::auth::{Authenticator, SessionStore};
use crate::deployment::Deployment;
use crate::fields::{self, FieldType};
use crate::jenkins::Jenkins;
use crate::keys;
use crate::store::DeploymentStore;
use crate::supervisor::{StartError, TaskSupervisor};
use crate::task::{DeployTask, ProgressSink};
use crate::templates;

/// Pages a request can target; the login form validates its `page`
/// parameter against this list.
const PAGES: &[&str] = &[
    "index", "login", "logout", "css", "list", "create", "edit", "deploy",
];

const SESSION_COOKIE: &str = "deployd_session";

type Resp = Response<Cursor<Vec<u8>>>;

/// Failures a handler can map to an HTTP response.
#[derive(Debug)]
enum HttpError {
    /// Missing or invalid request parameters.
    BadRequest(String),
    /// Deployment name unknown.
    NotFound(String),
    /// Duplicate name on create; surfaces as a 500 like any other
    /// unexpected server-side rejection.
    Conflict(String),
    /// Everything else.
    Internal(anyhow::Error),
}

impl HttpError {
    fn status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::Internal(_) => 500,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::BadRequest(message) | Self::NotFound(message) | Self::Conflict(message) => {
                message.clone()
            }
            Self::Internal(err) => format!("{err:#}"),
        }
    }
}

impl From<anyhow::Error> for HttpError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

/// A parsed request: everything a handler needs, body included.
struct HttpRequest {
    method: Method,
    page: String,
    raw_query: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
    content_type: Option<String>,
    session_token: Option<String>,
    if_none_match: Option<String>,
}

impl HttpRequest {
    fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// One uploaded file part.
struct Upload {
    filename: String,
    data: Vec<u8>,
}

/// Decoded form submission, urlencoded or multipart.
#[derive(Default)]
struct FormData {
    values: HashMap<String, Vec<String>>,
    files: HashMap<String, Vec<Upload>>,
}

impl FormData {
    fn first(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    fn parse(request: &HttpRequest) -> Result<Self, HttpError> {
        let content_type = request.content_type.as_deref().unwrap_or("");
        if let Some(boundary) = multipart_boundary(content_type) {
            Self::parse_multipart(&request.body, &boundary)
        } else {
            Ok(Self::parse_urlencoded(&request.body))
        }
    }

    fn parse_urlencoded(body: &[u8]) -> Self {
        let mut form = Self::default();
        for (name, value) in form_urlencoded::parse(body) {
            form.values
                .entry(name.into_owned())
                .or_default()
                .push(value.into_owned());
        }
        form
    }

    fn parse_multipart(body: &[u8], boundary: &str) -> Result<Self, HttpError> {
        let mut form = Self::default();
        let mut parts = multipart::server::Multipart::with_body(Cursor::new(body), boundary);
        loop {
            let entry = parts
                .read_entry()
                .map_err(|err| HttpError::BadRequest(format!("invalid form body: {err}")))?;
            let Some(mut entry) = entry else {
                break;
            };
            let name = entry.headers.name.to_string();
            let mut data = Vec::new();
            entry
                .data
                .read_to_end(&mut data)
                .map_err(|err| HttpError::BadRequest(format!("invalid form body: {err}")))?;
            match entry.headers.filename.clone() {
                Some(filename) => {
                    form.files.entry(name).or_default().push(Upload {
                        filename,
                        data,
                    });
                }
                None => {
                    form.values
                        .entry(name)
                        .or_default()
                        .push(String::from_utf8_lossy(&data).into_owned());
                }
            }
        }
        Ok(form)
    }
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    if parts.next()?.trim() != "multipart/form-data" {
        return None;
    }
    parts.find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        (key == "boundary").then(|| value.trim_matches('"').to_string())
    })
}

/// One entry on the list page.
#[derive(Debug, Serialize)]
struct ListEntry {
    name: String,
    status: &'static str,
    url: Option<String>,
}

/// One rendered form field.
#[derive(Debug, Serialize)]
struct FieldView {
    name: &'static str,
    label: &'static str,
    input_type: &'static str,
    value: String,
    checked: bool,
    file: bool,
}

/// The request-handling surface of the control plane.
pub struct Controller {
    mount: String,
    deploy_path: PathBuf,
    store: DeploymentStore,
    supervisor: Arc<TaskSupervisor>,
    sessions: SessionStore,
    auth: Box<dyn Authenticator>,
    jenkins: Option<Jenkins>,
    templates: Environment<'static>,
}

impl Controller {
    pub fn new(
        mount: &str,
        deploy_path: &Path,
        auth: Box<dyn Authenticator>,
        jenkins: Option<Jenkins>,
    ) -> Result<Self> {
        Ok(Self {
            mount: format!("/{}", mount.trim_matches('/')),
            deploy_path: deploy_path.to_path_buf(),
            store: DeploymentStore::new(deploy_path),
            supervisor: Arc::new(TaskSupervisor::new()),
            sessions: SessionStore::new(),
            auth,
            jenkins,
            templates: templates::environment()?,
        })
    }

    pub fn supervisor(&self) -> &Arc<TaskSupervisor> {
        &self.supervisor
    }

    pub fn store(&self) -> &DeploymentStore {
        &self.store
    }

    /// Handle one request end to end, including the response write.
    pub fn handle(&self, mut request: tiny_http::Request) {
        let parsed = match self.parse(&mut request) {
            Ok(parsed) => parsed,
            Err(err) => {
                let response = self.error_response(&err);
                if let Err(err) = request.respond(response) {
                    warn!("failed to send response: {err}");
                }
                return;
            }
        };

        let response = match self.route(&parsed) {
            Ok(response) => response,
            Err(err) => {
                if matches!(err, HttpError::Internal(_)) {
                    error!("request for {} failed: {}", parsed.page, err.message());
                }
                self.error_response(&err)
            }
        };
        if let Err(err) = request.respond(response) {
            warn!("failed to send response: {err}");
        }
    }

    fn parse(&self, request: &mut tiny_http::Request) -> Result<HttpRequest, HttpError> {
        let url = request.url().to_string();
        let (path, raw_query) = match url.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (url, String::new()),
        };

        let page = match path.strip_prefix(&self.mount) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                let page = rest.trim_matches('/');
                if page.is_empty() {
                    "index".to_string()
                } else {
                    page.to_string()
                }
            }
            _ => {
                return Err(HttpError::NotFound(format!("Path {path} does not exist")));
            }
        };

        let mut content_type = None;
        let mut session_token = None;
        let mut if_none_match = None;
        for header in request.headers() {
            if header.field.equiv("Content-Type") {
                content_type = Some(header.value.as_str().to_string());
            } else if header.field.equiv("Cookie") {
                session_token = session_cookie(header.value.as_str());
            } else if header.field.equiv("If-None-Match") {
                if_none_match = Some(header.value.as_str().trim_matches('"').to_string());
            }
        }

        let mut body = Vec::new();
        if *request.method() == Method::Post {
            request
                .as_reader()
                .read_to_end(&mut body)
                .map_err(|err| HttpError::BadRequest(format!("invalid request body: {err}")))?;
        }

        let query = form_urlencoded::parse(raw_query.as_bytes())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        Ok(HttpRequest {
            method: request.method().clone(),
            page,
            raw_query,
            query,
            body,
            content_type,
            session_token,
            if_none_match,
        })
    }

    fn route(&self, request: &HttpRequest) -> Result<Resp, HttpError> {
        match request.page.as_str() {
            "index" => self.index(request),
            "login" => self.login(request),
            "logout" => self.logout(request),
            "css" => self.css(request),
            "list" => self.list(request),
            "create" => self.create(request),
            "edit" => self.edit(request),
            "deploy" => self.deploy(request),
            page => Err(HttpError::NotFound(format!("Page {page} does not exist"))),
        }
    }

    // Session plumbing

    fn session_user(&self, request: &HttpRequest) -> Option<String> {
        request
            .session_token
            .as_deref()
            .and_then(|token| self.sessions.user(token))
    }

    /// The logged-in user, or the redirect that sends the client to the
    /// login page targeting the current request.
    fn require_login(&self, request: &HttpRequest) -> Result<String, Box<Resp>> {
        match self.session_user(request) {
            Some(user) => Ok(user),
            None => {
                info!("no credentials or session found");
                let params: String = form_urlencoded::Serializer::new(String::new())
                    .append_pair("page", &request.page)
                    .append_pair("params", &request.raw_query)
                    .finish();
                Err(Box::new(redirect(&format!(
                    "{}/index?{params}",
                    self.mount
                ))))
            }
        }
    }

    // Handlers

    fn index(&self, request: &HttpRequest) -> Result<Resp, HttpError> {
        let page = request.param("page").unwrap_or("list");
        validate_page(page)?;
        let params = request.param("params").unwrap_or("");

        self.render(
            "login.html",
            context! { title => "Login", page => page, params => params },
        )
    }

    fn login(&self, request: &HttpRequest) -> Result<Resp, HttpError> {
        let page = request.param("page").unwrap_or("list").to_string();
        validate_page(&page)?;
        let params = request.param("params").unwrap_or("").to_string();

        let target = if params.is_empty() {
            format!("{}/{page}", self.mount)
        } else {
            format!("{}/{page}?{params}", self.mount)
        };

        if request.method != Method::Post {
            if request.param("username").is_some() || request.param("password").is_some() {
                return Err(HttpError::BadRequest(
                    "POST only allowed for username and password".to_string(),
                ));
            }
            if self.session_user(request).is_some() {
                return Ok(redirect(&target));
            }
            let back: String = form_urlencoded::Serializer::new(String::new())
                .append_pair("page", &page)
                .append_pair("params", &params)
                .finish();
            return Ok(redirect(&format!("{}/index?{back}", self.mount)));
        }

        let form = FormData::parse(request)?;
        let (Some(username), Some(password)) = (form.first("username"), form.first("password"))
        else {
            return Err(HttpError::BadRequest(
                "Parameters 'username' and 'password' are required".to_string(),
            ));
        };

        if self.auth.verify(username, password) {
            let token = self.sessions.create(username);
            let mut response = redirect(&target);
            response.add_header(
                header(
                    "Set-Cookie",
                    &format!("{SESSION_COOKIE}={token}; Path={}; HttpOnly", self.mount),
                )?,
            );
            Ok(response)
        } else {
            info!("credentials invalid");
            let back: String = form_urlencoded::Serializer::new(String::new())
                .append_pair("page", &page)
                .append_pair("params", &params)
                .finish();
            Ok(redirect(&format!("{}/index?{back}", self.mount)))
        }
    }

    fn logout(&self, request: &HttpRequest) -> Result<Resp, HttpError> {
        if let Some(token) = request.session_token.as_deref() {
            self.sessions.remove(token);
        }
        let mut response = redirect(&format!("{}/index", self.mount));
        response.add_header(
            header(
                "Set-Cookie",
                &format!("{SESSION_COOKIE}=; Path={}; Max-Age=0", self.mount),
            )?,
        );
        Ok(response)
    }

    fn css(&self, request: &HttpRequest) -> Result<Resp, HttpError> {
        let etag = hex::encode(Sha256::digest(templates::CSS.as_bytes()));
        if request.if_none_match.as_deref() == Some(etag.as_str()) {
            let mut response = Response::from_data(Vec::new()).with_status_code(304);
            response.add_header(header("ETag", &format!("\"{etag}\""))?);
            return Ok(response);
        }

        let mut response = Response::from_data(templates::CSS.as_bytes().to_vec());
        response.add_header(header("Content-Type", "text/css; charset=utf-8")?);
        response.add_header(header("ETag", &format!("\"{etag}\""))?);
        Ok(response)
    }

    fn list(&self, request: &HttpRequest) -> Result<Resp, HttpError> {
        let user = match self.require_login(request) {
            Ok(user) => user,
            Err(response) => return Ok(*response),
        };

        let mut deployments = self.store.snapshot()?;
        deployments.sort_by(|a, b| a.name.cmp(&b.name));

        let entries: Vec<ListEntry> = deployments
            .iter()
            .map(|deployment| {
                if deployment.is_up_to_date() {
                    ListEntry {
                        name: deployment.name.clone(),
                        status: "Up to date",
                        url: deployment.tree_url(),
                    }
                } else {
                    ListEntry {
                        name: deployment.name.clone(),
                        status: "Outdated",
                        url: deployment.compare_url(),
                    }
                }
            })
            .collect();

        self.render(
            "list.html",
            context! { title => "List", user => user, deployments => entries },
        )
    }

    fn create(&self, request: &HttpRequest) -> Result<Resp, HttpError> {
        let user = match self.require_login(request) {
            Ok(user) => user,
            Err(response) => return Ok(*response),
        };

        if request.method != Method::Post {
            let views = field_views(&Deployment::default(), false);
            return self.render(
                "create.html",
                context! { title => "Create", user => user, fields => views },
            );
        }

        let form = FormData::parse(request)?;
        let name = form
            .first("name")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| HttpError::BadRequest("Parameter 'name' is required".to_string()))?
            .to_string();

        let mut secrets = IndexMap::new();
        apply_uploads(&mut secrets, form.files.get("secret_files").unwrap_or(&Vec::new()));

        let public_key = self.add_deployment(&form, &name, None, secrets)?;

        let views = field_views(&Deployment::default(), false);
        self.render(
            "create.html",
            context! {
                title => "Create",
                user => user,
                fields => views,
                name => name,
                public_key => public_key,
            },
        )
    }

    fn edit(&self, request: &HttpRequest) -> Result<Resp, HttpError> {
        let user = match self.require_login(request) {
            Ok(user) => user,
            Err(response) => return Ok(*response),
        };

        if request.method != Method::Post {
            // Parameter 'name' required
            let Some(name) = request.param("name").filter(|name| !name.is_empty()) else {
                return Ok(redirect(&format!("{}/list", self.mount)));
            };
            let deployment = self
                .store
                .get(name)?
                .ok_or_else(|| HttpError::NotFound(format!("Deployment {name} does not exist")))?;
            let views = field_views(&deployment, true);
            return self.render(
                "edit.html",
                context! { title => "Edit", user => user, fields => views, name => name },
            );
        }

        let form = FormData::parse(request)?;
        let name = form
            .first("name")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| HttpError::BadRequest("Parameter 'name' is required".to_string()))?
            .to_string();
        let old_name = form
            .first("old_name")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| HttpError::BadRequest("Parameter 'old_name' is required".to_string()))?
            .to_string();

        let old_deployment = self
            .store
            .get(&old_name)?
            .ok_or_else(|| HttpError::NotFound(format!("Deployment {old_name} does not exist")))?;

        // Keep or rotate the deploy key according to the checkbox state.
        let (deploy_key, key_state) = if fields::coerce_bool(form.first("deploy_key")) {
            (Some(old_deployment.deploy_key.clone()), "original")
        } else {
            let old_key = Path::new(&old_deployment.deploy_key);
            if !old_deployment.deploy_key.is_empty() && old_key.exists() {
                fs::remove_file(old_key).with_context(|| {
                    format!("failed to remove old deploy key {}", old_key.display())
                })?;
            }
            (None, "new")
        };

        let secret_names: Vec<String> = form
            .first("secret_files_names")
            .unwrap_or("")
            .split(' ')
            .map(str::to_string)
            .collect();
        cleanup_old_secrets(&old_deployment, &secret_names);
        let mut secrets = reconcile_secret_names(&secret_names, &old_deployment.secret_files);
        apply_uploads(&mut secrets, form.files.get("secret_files").unwrap_or(&Vec::new()));

        self.store.mutate(|set| set.discard(&old_name))?;
        let public_key = match self.add_deployment(&form, &name, deploy_key, secrets) {
            Ok(public_key) => public_key,
            Err(err) => {
                // Put the old deployment back so a rejected rename does not
                // drop the configuration.
                self.store.mutate(|set| set.add(old_deployment))?;
                return Err(err);
            }
        };

        let deployment = self
            .store
            .get(&name)?
            .ok_or_else(|| HttpError::NotFound(format!("Deployment {name} does not exist")))?;
        let views = field_views(&deployment, true);
        self.render(
            "edit.html",
            context! {
                title => "Edit",
                user => user,
                fields => views,
                name => name,
                public_key => public_key,
                key_state => key_state,
            },
        )
    }

    fn deploy(&self, request: &HttpRequest) -> Result<Resp, HttpError> {
        if let Err(response) = self.require_login(request) {
            return Ok(*response);
        }

        if request.method != Method::Post {
            let Some(name) = request.param("name").filter(|name| !name.is_empty()) else {
                return Ok(redirect(&format!("{}/list", self.mount)));
            };
            self.store
                .get(name)?
                .ok_or_else(|| HttpError::NotFound(format!("Deployment {name} does not exist")))?;

            let Some(progress) = self.supervisor.progress(name) else {
                return Ok(redirect(&format!("{}/list", self.mount)));
            };
            return self.render(
                "deploy_status.html",
                context! {
                    title => "Deploy",
                    name => name,
                    state => progress.state.as_str(),
                    message => progress.message,
                },
            );
        }

        let form = FormData::parse(request)?;
        let name = form
            .first("name")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| HttpError::BadRequest("Parameter 'name' is required".to_string()))?
            .to_string();
        let deployment = self
            .store
            .get(&name)?
            .ok_or_else(|| HttpError::NotFound(format!("Deployment {name} does not exist")))?;

        let supervisor = Arc::clone(&self.supervisor);
        let sink: Arc<dyn ProgressSink> = Arc::clone(&self.supervisor) as Arc<dyn ProgressSink>;
        let jenkins = self.jenkins.clone();
        let start = supervisor.start(&name, move |stop| {
            DeployTask::new(deployment, jenkins, sink, stop).run();
        });

        match start {
            Ok(()) => self.render(
                "deploy_started.html",
                context! { title => "Deploy", name => name },
            ),
            Err(StartError::AlreadyUnderway(_)) => self.render(
                "deploy_underway.html",
                context! { title => "Deploy", name => name },
            ),
            Err(err) => Err(HttpError::Internal(err.into())),
        }
    }

    /// Build a deployment from the form, generate or reuse its deploy key,
    /// add it to the store, and return the public key to display.
    fn add_deployment(
        &self,
        form: &FormData,
        name: &str,
        deploy_key: Option<String>,
        secret_files: IndexMap<String, String>,
    ) -> Result<String, HttpError> {
        if self.store.with_set(|set| set.contains(name))? {
            return Err(HttpError::Conflict(format!(
                "Deployment '{name}' already exists"
            )));
        }

        let deploy_key = match deploy_key {
            Some(path) if !path.is_empty() => path,
            _ => keys::generate(&self.deploy_path, name)?
                .to_string_lossy()
                .to_string(),
        };

        let deployment = deployment_from_form(form, name, &deploy_key, secret_files);
        self.store.mutate(|set| set.add(deployment))?;

        Ok(keys::public_key(Path::new(&deploy_key))?)
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<Resp, HttpError> {
        let template = self
            .templates
            .get_template(name)
            .map_err(|err| HttpError::Internal(err.into()))?;
        let body = template
            .render(ctx)
            .map_err(|err| HttpError::Internal(err.into()))?;
        html(body, 200)
    }

    fn error_response(&self, err: &HttpError) -> Resp {
        let rendered = self
            .templates
            .get_template("message.html")
            .ok()
            .and_then(|template| {
                template
                    .render(context! {
                        title => "Error",
                        kind => "error",
                        message => err.message(),
                    })
                    .ok()
            });

        match rendered.map(|body| html(body, err.status())) {
            Some(Ok(response)) => response,
            _ => Response::from_data(err.message().into_bytes()).with_status_code(err.status()),
        }
    }
}

// Form-to-deployment coercion

fn deployment_from_form(
    form: &FormData,
    name: &str,
    deploy_key: &str,
    secret_files: IndexMap<String, String>,
) -> Deployment {
    let text = |field: &str| form.first(field).unwrap_or("").to_string();

    Deployment {
        name: name.to_string(),
        git_path: text("git_path"),
        git_url: text("git_url"),
        git_branch: form
            .first("git_branch")
            .map(str::to_string)
            .unwrap_or_else(|| fields::DEFAULT_BRANCH.to_string()),
        deploy_key: deploy_key.to_string(),
        jenkins_job: text("jenkins_job"),
        jenkins_git: fields::coerce_bool(form.first("jenkins_git")),
        jenkins_states: fields::split_list(&text("jenkins_states")),
        artifacts: fields::coerce_bool(form.first("artifacts")),
        script: text("script"),
        services: fields::split_list(&text("services")),
        bigboat_url: text("bigboat_url"),
        bigboat_key: text("bigboat_key"),
        bigboat_compose: text("bigboat_compose"),
        secret_files,
    }
}

/// Zip the incoming destination names against the old mapping: a position
/// present in both carries its content forward, a position new to the list
/// starts empty, a removed position drops out. Empty names are discarded.
fn reconcile_secret_names(
    new_names: &[String],
    old: &IndexMap<String, String>,
) -> IndexMap<String, String> {
    let old_names: Vec<&String> = old.keys().collect();
    let mut secrets = IndexMap::new();
    for (position, name) in new_names.iter().enumerate() {
        if name.is_empty() {
            continue;
        }
        let content = old_names
            .get(position)
            .and_then(|old_name| old.get(*old_name))
            .cloned()
            .unwrap_or_default();
        secrets.insert(name.clone(), content);
    }
    secrets
}

/// Remove physical secret files from the working copy when the name list
/// changed; files may be present from prior deployments and would otherwise
/// never be overwritten.
fn cleanup_old_secrets(old: &Deployment, new_names: &[String]) {
    let old_names: Vec<&str> = old.secret_files.keys().map(String::as_str).collect();
    let unchanged = old_names
        .iter()
        .copied()
        .eq(new_names.iter().map(String::as_str));
    if unchanged {
        return;
    }

    for name in old.secret_files.keys() {
        let path = Path::new(&old.git_path).join(name);
        if path.is_file() {
            if let Err(err) = fs::remove_file(&path) {
                warn!("failed to remove old secret file {}: {err}", path.display());
            }
        }
    }
}

/// Overlay uploaded file contents onto the secret mapping positionally;
/// uploads beyond the known names take their destination from the uploaded
/// filename.
fn apply_uploads(secrets: &mut IndexMap<String, String>, uploads: &[Upload]) {
    for (position, upload) in uploads.iter().enumerate() {
        if upload.filename.is_empty() && upload.data.is_empty() {
            continue;
        }
        let name = secrets
            .get_index(position)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| fields::extract_filename(&upload.filename).to_string());
        if name.is_empty() {
            continue;
        }
        info!("reading uploaded file for name {name}");
        secrets.insert(name, String::from_utf8_lossy(&upload.data).into_owned());
    }
}

fn field_views(deployment: &Deployment, include_deploy_key: bool) -> Vec<FieldView> {
    fields::FIELDS
        .iter()
        .filter(|spec| include_deploy_key || spec.name != "deploy_key")
        .map(|spec| {
            let (input_type, value, checked, file) = match spec.ty {
                FieldType::Bool => {
                    let checked = match spec.name {
                        "jenkins_git" => deployment.jenkins_git,
                        "artifacts" => deployment.artifacts,
                        // Keep the existing key by default on edit.
                        "deploy_key" => true,
                        _ => false,
                    };
                    ("checkbox", "1".to_string(), checked, false)
                }
                FieldType::List => ("text", field_list_value(deployment, spec.name), false, false),
                FieldType::File => {
                    let names: Vec<&str> = deployment
                        .secret_files
                        .keys()
                        .map(String::as_str)
                        .collect();
                    ("file", names.join(" "), false, true)
                }
                FieldType::Str | FieldType::Job => {
                    ("text", field_text_value(deployment, spec.name), false, false)
                }
            };
            FieldView {
                name: spec.name,
                label: spec.label,
                input_type,
                value,
                checked,
                file,
            }
        })
        .collect()
}

fn field_text_value(deployment: &Deployment, name: &str) -> String {
    match name {
        "name" => deployment.name.clone(),
        "git_path" => deployment.git_path.clone(),
        "git_url" => deployment.git_url.clone(),
        "git_branch" => deployment.git_branch.clone(),
        "jenkins_job" => deployment.jenkins_job.clone(),
        "script" => deployment.script.clone(),
        "bigboat_url" => deployment.bigboat_url.clone(),
        "bigboat_key" => deployment.bigboat_key.clone(),
        "bigboat_compose" => deployment.bigboat_compose.clone(),
        _ => String::new(),
    }
}

fn field_list_value(deployment: &Deployment, name: &str) -> String {
    match name {
        "jenkins_states" => deployment.jenkins_states.join(","),
        "services" => deployment.services.join(","),
        _ => String::new(),
    }
}

// Response plumbing

fn header(name: &str, value: &str) -> Result<Header, HttpError> {
    Header::from_bytes(name.as_bytes(), value.as_bytes())
        .map_err(|()| HttpError::Internal(anyhow!("invalid header {name}: {value}")))
}

fn html(body: String, status: u16) -> Result<Resp, HttpError> {
    let mut response = Response::from_data(body.into_bytes()).with_status_code(status);
    response.add_header(header("Content-Type", "text/html; charset=utf-8")?);
    Ok(response)
}

fn redirect(location: &str) -> Resp {
    let mut response = Response::from_data(Vec::new()).with_status_code(302);
    if let Ok(header) = header("Location", location) {
        response.add_header(header);
    }
    response
}

fn session_cookie(value: &str) -> Option<String> {
    value.split(';').find_map(|part| {
        let (name, token) = part.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| token.to_string())
    })
}

fn validate_page(page: &str) -> Result<(), HttpError> {
    if PAGES.contains(&page) {
        Ok(())
    } else {
        Err(HttpError::BadRequest("Page must be valid".to_string()))
    }
}

/// The HTTP server: a shared listener drained by a pool of handler threads.
pub struct WebServer {
    server: tiny_http::Server,
    controller: Arc<Controller>,
    running: Arc<AtomicBool>,
}

impl WebServer {
    pub fn bind(controller: Arc<Controller>, listen: &str) -> Result<Self> {
        let server = tiny_http::Server::http(listen)
            .map_err(|err| anyhow!("failed to bind {listen}: {err}"))?;
        Ok(Self {
            server,
            controller,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// The bound port, for listeners configured with port 0.
    pub fn port(&self) -> Option<u16> {
        self.server.server_addr().to_ip().map(|addr| addr.port())
    }

    /// Flag that stops the accept loops when cleared.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Serve until the stop flag clears. Blocks the calling thread.
    pub fn run(&self, workers: usize) {
        info!("listening on {}", self.server.server_addr());
        std::thread::scope(|scope| {
            for _ in 0..workers.max(1) {
                scope.spawn(|| {
                    while self.running.load(Ordering::SeqCst) {
                        match self.server.recv_timeout(Duration::from_millis(250)) {
                            Ok(Some(request)) => self.controller.handle(request),
                            Ok(None) => {}
                            Err(err) => {
                                warn!("failed to receive request: {err}");
                                break;
                            }
                        }
                    }
                });
            }
        });
    }
}
